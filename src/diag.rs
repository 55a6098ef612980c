//! Dump the state of the host for post-mortem debugging.

use chrono::offset::Local;

use log::debug;

use crate::common::shell::Cmd;
use crate::common::{escape_for_bash, Config, Execute};
use crate::preflight::command_path;
use crate::reaper::{own_pids, parse_pgrep, pgrep_pattern, Components, ProcessNames};
use crate::session::Session;

/// One titled block of the dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub title: String,
    pub body: String,
}

/// A snapshot of containers, sandboxes and runtime processes on the host.
#[derive(Debug, Clone)]
pub struct SystemState {
    pub taken_at: String,
    pub sections: Vec<Section>,
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "Showing system state ({}):", self.taken_at)?;
        for section in &self.sections {
            writeln!(f, " --{}--", section.title)?;
            if !section.body.is_empty() {
                writeln!(f, "{}", section.body)?;
            }
        }
        Ok(())
    }
}

/// Run a query, treating any failure as an empty answer.
fn query(shell: &dyn Execute, cmd: Cmd) -> String {
    match shell.run(cmd.allow_error()) {
        Ok(out) => out.stdout.trim_end().to_owned(),
        Err(err) => {
            debug!("query failed: {}", err);
            String::new()
        }
    }
}

/// Collect the state of the host. Never fails: anything that cannot be queried shows up empty.
/// Processes in `exclude` are left out of the process listings.
pub fn system_state(
    shell: &dyn Execute,
    config: &Config,
    names: &ProcessNames,
    exclude: &[u32],
) -> SystemState {
    let mut sections = vec![];

    sections.push(Section {
        title: format!("{} ps", config.docker_exe),
        body: query(shell, cmd!("{} ps -a", config.docker_exe)),
    });

    // `sudo` may not search the same path, so resolve the runtime first.
    let sandboxes = match command_path(shell, &config.runtime) {
        Ok(Some(path)) => query(shell, cmd!("sudo '{}' list", escape_for_bash(&path))),
        Ok(None) => String::new(),
        Err(err) => {
            debug!("unable to find {}: {}", config.runtime, err);
            String::new()
        }
    };
    sections.push(Section {
        title: format!("{} list", config.runtime),
        body: sandboxes,
    });

    for name in names.names(Components::all()) {
        let found = query(
            shell,
            cmd!("pgrep -a -f '{}'", escape_for_bash(&pgrep_pattern(name))),
        );
        let body: Vec<String> = parse_pgrep(&found, exclude)
            .into_iter()
            .map(|(pid, cmdline)| format!("{} {}", pid, cmdline).trim_end().to_owned())
            .collect();

        sections.push(Section {
            title: format!("pgrep {}", name),
            body: body.join("\n"),
        });
    }

    SystemState {
        taken_at: Local::now().to_rfc3339(),
        sections,
    }
}

/// Print the state of the host to stdout, leaving out this process and its parent.
pub fn show_system_state(shell: &dyn Execute, config: &Config, names: &ProcessNames) {
    print!("{}", system_state(shell, config, names, &own_pids()));
}

pub fn cli_options() -> clap::App<'static, 'static> {
    clap::SubCommand::with_name("show-state")
        .about("Print the containers, sandboxes and runtime processes on the host.")
}

pub fn run(
    shell: &dyn Execute,
    config: &Config,
    session: &Session,
    _sub_m: &clap::ArgMatches<'_>,
) -> Result<(), failure::Error> {
    let names = ProcessNames::new(config, session.runtime_env());
    show_system_state(shell, config, &names);

    if let Some(path) = session.path() {
        println!(" --session {}--", path.display());
        println!("{}", serde_json::to_string_pretty(session.state())?);
    }

    Ok(())
}
