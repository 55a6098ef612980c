//! This program puts a benchmarking host into a known state before and between metrics runs.
//! Which routine is run is chosen by passing different subcommands; some of them require extra
//! arguments.

// Useful common routines
#[macro_use]
mod common;

mod preflight;

mod images;

mod reaper;

mod runtime;
mod session;

mod ksm;

mod diag;

use std::io::Write;

use crate::common::{Config, Execute, SESSION_ENV};
use crate::session::Session;

fn cli() -> clap::App<'static, 'static> {
    clap::App::new("hostprep")
        .about(
            "This program puts a benchmarking host into a known state before and between \
             metrics runs. Which routine is run is chosen by passing different subcommands.",
        )
        .arg(
            clap::Arg::with_name("RUNTIME")
                .long("runtime")
                .takes_value(true)
                .help("The runtime under test. Defaults to $RUNTIME, then kata-runtime."),
        )
        .arg(
            clap::Arg::with_name("DOCKER")
                .long("docker")
                .takes_value(true)
                .help("The container engine binary. Defaults to $DOCKER_EXE, then docker."),
        )
        .arg(
            clap::Arg::with_name("SESSION")
                .long("session")
                .takes_value(true)
                .help(
                    "A file holding the state of the test session. Defaults to \
                     $HOSTPREP_SESSION. Without one, the session ends when this program exits.",
                ),
        )
        .arg(
            clap::Arg::with_name("KSM_DIR")
                .long("ksm-dir")
                .takes_value(true)
                .help("The KSM control directory (default: /sys/kernel/mm/ksm)."),
        )
        .arg(
            clap::Arg::with_name("DRY")
                .short("d")
                .long("dry-run")
                .help("Don't actually execute commands. Just print what would run."),
        )
        .arg(
            clap::Arg::with_name("REMOTE")
                .long("remote")
                .takes_value(true)
                .requires("USERNAME")
                .help(
                    "Run everything on the given remote over SSH \
                     (e.g. c240g2-031321.wisc.cloudlab.us:22).",
                ),
        )
        .arg(
            clap::Arg::with_name("USERNAME")
                .long("user")
                .takes_value(true)
                .help("The username on the remote (e.g. markm)"),
        )
        .subcommand(preflight::cli_options())
        .subcommand(images::pull_cli_options())
        .subcommand(images::check_cli_options())
        .subcommand(reaper::cli_options())
        .subcommand(session::cli_options())
        .subcommand(ksm::cli_options())
        .subcommand(diag::cli_options())
        .setting(clap::AppSettings::SubcommandRequired)
        .setting(clap::AppSettings::DisableVersion)
}

/// Settings from the environment, overridden by command line flags.
fn config(matches: &clap::ArgMatches<'_>) -> Config {
    let mut config = Config::from_env();

    if let Some(runtime) = matches.value_of("RUNTIME") {
        config.runtime = runtime.into();
    }
    if let Some(docker) = matches.value_of("DOCKER") {
        config.docker_exe = docker.into();
    }
    if let Some(ksm_dir) = matches.value_of("KSM_DIR") {
        config.ksm_base = ksm_dir.into();
    }

    config
}

fn connect(matches: &clap::ArgMatches<'_>) -> Result<Box<dyn Execute>, failure::Error> {
    let dry_run = matches.is_present("DRY");

    match matches.value_of("REMOTE") {
        None => {
            let mut shell = common::shell::LocalShell::new();
            shell.set_dry_run(dry_run);
            Ok(Box::new(shell))
        }

        Some(remote) => {
            let username = matches.value_of("USERNAME").unwrap();
            Ok(Box::new(common::shell::RemoteShell::connect(
                username, remote, dry_run,
            )?))
        }
    }
}

fn run() -> Result<(), failure::Error> {
    let matches = cli().get_matches();

    let config = config(&matches);

    // Export the session file so that anything a test spawns from here on shares the session.
    let mut session = match matches.value_of("SESSION") {
        Some(path) => {
            std::env::set_var(SESSION_ENV, path);
            Session::open(path)?
        }
        None => Session::from_env()?,
    };

    session.set_dry_run(matches.is_present("DRY"));

    let shell = connect(&matches)?;
    let shell: &dyn Execute = &*shell;

    match matches.subcommand() {
        ("check-cmds", Some(sub_m)) => preflight::run(shell, sub_m),
        ("pull-images", Some(sub_m)) => images::run_pull(shell, &config, sub_m),
        ("check-image", Some(sub_m)) => images::run_check(shell, &config, sub_m),
        ("reset", Some(sub_m)) => reaper::run(shell, &config, &session, sub_m),
        ("init", Some(sub_m)) => session::run(shell, &config, &mut session, sub_m),
        ("ksm", Some(sub_m)) => ksm::run(shell, &config, &mut session, sub_m),
        ("show-state", Some(sub_m)) => diag::run(shell, &config, &session, sub_m),

        _ => {
            unreachable!();
        }
    }
}

/// Log lines go to stderr. Errors and warnings carry an `ERROR:`/`WARNING:` prefix that the
/// report tooling looks for; `RUST_LOG` overrides the default `info` level.
fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| match record.level() {
            log::Level::Error => writeln!(buf, "ERROR: {}", record.args()),
            log::Level::Warn => writeln!(buf, "WARNING: {}", record.args()),
            log::Level::Info => writeln!(buf, "{}", record.args()),
            level => writeln!(buf, "{}: {}", level, record.args()),
        })
        .init();
}

fn main() {
    use console::style;

    init_logger();

    if let Err(err) = run() {
        eprintln!("{}", style(format!("ERROR: {}", err)).red().bold());

        // Errors from commands run on the host
        if let Some(common::HarnessError::NonZeroExit { .. }) =
            err.downcast_ref::<common::HarnessError>()
        {
            eprintln!("A command failed on the host. Rerun with RUST_LOG=debug to see every command.");
        }

        // Errors from SSH commands
        if err.downcast_ref::<spurs::SshError>().is_some() {
            eprintln!("An error occurred while attempting to run a command over SSH");
        }

        log::debug!("{}", err.backtrace());

        std::process::exit(1);
    }
}
