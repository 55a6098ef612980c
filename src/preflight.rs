//! Make sure the commands a test needs are installed before doing anything else.

use log::info;

use crate::common::{escape_for_bash, output_lines, Execute, HarnessError};

pub fn cli_options() -> clap::App<'static, 'static> {
    clap::SubCommand::with_name("check-cmds")
        .about("Check that all of the given commands are on the search path of the host.")
        .arg(
            clap::Arg::with_name("CMDS")
                .required(true)
                .multiple(true)
                .help("The commands to look for (e.g. docker kata-runtime)"),
        )
}

pub fn run(shell: &dyn Execute, sub_m: &clap::ArgMatches<'_>) -> Result<(), failure::Error> {
    let cmds: Vec<&str> = sub_m.values_of("CMDS").unwrap().collect();
    check_cmds(shell, &cmds)
}

/// Resolve `name` on the search path of the host. Returns `None` if it is not there.
pub fn command_path(shell: &dyn Execute, name: &str) -> Result<Option<String>, failure::Error> {
    let out = shell.run(cmd!("command -v '{}'", escape_for_bash(name)).allow_error())?;
    Ok(output_lines(&out.stdout).into_iter().next())
}

/// Check that every command in `cmds` is available. Stops at the first one that is not.
pub fn check_cmds<S: AsRef<str>>(shell: &dyn Execute, cmds: &[S]) -> Result<(), failure::Error> {
    for cmd in cmds.iter().map(AsRef::as_ref) {
        if command_path(shell, cmd)?.is_none() {
            return Err(HarnessError::MissingCommand(cmd.into()).into());
        }
        info!("command: {}: yes", cmd);
    }

    Ok(())
}
