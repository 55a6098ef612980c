//! Running commands on the host under test.
//!
//! Every routine in this crate talks to the host through the `Execute` trait, so the same code
//! drives the local machine, a remote machine over SSH through `spurs`, or a recording mock in
//! tests.

use std::process::Command;

use log::debug;

use super::HarnessError;

/// A command to be run by `bash` on the host. Usually constructed with `cmd!`.
#[derive(Debug, Clone)]
pub struct Cmd {
    cmd: String,
    allow_error: bool,
}

impl Cmd {
    pub fn make_cmd(cmd: String) -> Self {
        Cmd {
            cmd,
            allow_error: false,
        }
    }

    /// A non-zero exit is not an error. The output is returned as usual.
    pub fn allow_error(mut self) -> Self {
        self.allow_error = true;
        self
    }

    pub fn as_str(&self) -> &str {
        &self.cmd
    }

    pub fn allows_error(&self) -> bool {
        self.allow_error
    }
}

/// The captured output of a command.
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

/// Something that can run commands on the host under test.
pub trait Execute {
    /// Run `cmd` to completion. Fails if the command cannot be started or, unless the command
    /// allows errors, if it exits non-zero.
    fn run(&self, cmd: Cmd) -> Result<Output, failure::Error>;

    /// Commands are only printed, and every command succeeds with empty output.
    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Runs commands on this machine with `bash -c`.
#[derive(Debug, Default)]
pub struct LocalShell {
    dry_run: bool,
}

impl LocalShell {
    pub fn new() -> Self {
        LocalShell { dry_run: false }
    }

    /// In dry-run mode, commands are logged but not executed and produce empty output.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }
}

impl Execute for LocalShell {
    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn run(&self, cmd: Cmd) -> Result<Output, failure::Error> {
        debug!("$ {}", cmd.cmd);

        if self.dry_run {
            println!("(dry run) {}", cmd.cmd);
            return Ok(Output::default());
        }

        let mut command = Command::new("bash");
        command.arg("-c").arg(&cmd.cmd);

        let output = command.output().map_err(|err| {
            failure::format_err!("Error in executing \"bash -c {}\": {}", cmd.cmd, err)
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        debug!("{}", stdout.trim_end());

        if !output.status.success() && !cmd.allow_error {
            return Err(HarnessError::NonZeroExit {
                cmd: cmd.cmd,
                exit: output.status.code(),
                stderr: stderr.trim().to_owned(),
            }
            .into());
        }

        Ok(Output { stdout, stderr })
    }
}

/// Runs commands on a remote machine over SSH.
pub struct RemoteShell {
    shell: spurs::SshShell,
    dry_run: bool,
}

impl RemoteShell {
    /// Connect to `host` (e.g. `c240g2-031321.wisc.cloudlab.us:22`) as `username` using the
    /// default SSH key.
    pub fn connect(username: &str, host: &str, dry_run: bool) -> Result<Self, failure::Error> {
        let mut shell = spurs::SshShell::with_default_key(username, host)?;
        shell.set_dry_run(dry_run);
        Ok(RemoteShell { shell, dry_run })
    }
}

impl Execute for RemoteShell {
    fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn run(&self, cmd: Cmd) -> Result<Output, failure::Error> {
        use spurs::Execute as _;

        let mut remote = spurs::cmd!("{}", cmd.cmd).use_bash();
        if cmd.allow_error {
            remote = remote.allow_error();
        }

        let output = self.shell.run(remote)?;

        Ok(Output {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
