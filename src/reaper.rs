//! Get rid of anything a previous test left behind: containers, and the helper processes of the
//! runtime under test. Run before every test.

use std::time::Duration;

use bitflags::bitflags;

use clap::clap_app;

use log::{info, warn};

use crate::common::{basename, escape_for_bash, output_lines, Config, Execute, HarnessError};
use crate::runtime::RuntimeEnv;
use crate::session::Session;

/// How long to give killed processes to disappear before looking for them again.
const REAP_GRACE: Duration = Duration::from_millis(500);

bitflags! {
    /// The components of a runtime that run as host processes.
    pub struct Components: u32 {
        const PROXY = 1;
        const SHIM = 1 << 1;
        const RUNTIME = 1 << 2;
        const HYPERVISOR = 1 << 3;
        const THROTTLER = 1 << 4;
    }
}

/// The process names of each component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessNames {
    pub proxy: String,
    pub shim: String,
    pub runtime: String,
    pub hypervisor: String,
    pub throttler: String,
}

impl ProcessNames {
    /// Names come from the runtime environment if we have one, falling back to the usual Kata
    /// binaries otherwise.
    pub fn new(config: &Config, env: Option<&RuntimeEnv>) -> Self {
        fn from_env<F>(env: Option<&RuntimeEnv>, field: F, default: &str) -> String
        where
            F: Fn(&RuntimeEnv) -> &str,
        {
            env.map(|env| basename(field(env)))
                .filter(|name| !name.is_empty())
                .unwrap_or(default)
                .to_owned()
        }

        ProcessNames {
            proxy: from_env(env, |env| env.proxy_path.as_str(), "kata-proxy"),
            shim: from_env(env, |env| env.shim_path.as_str(), "kata-shim"),
            runtime: basename(&config.runtime).to_owned(),
            hypervisor: from_env(env, |env| env.hypervisor_path.as_str(), "qemu"),
            throttler: "kata-ksm-throttler".into(),
        }
    }

    /// The names of the selected components, in a fixed order.
    pub fn names(&self, which: Components) -> Vec<&str> {
        let all = [
            (Components::PROXY, self.proxy.as_str()),
            (Components::SHIM, self.shim.as_str()),
            (Components::RUNTIME, self.runtime.as_str()),
            (Components::HYPERVISOR, self.hypervisor.as_str()),
            (Components::THROTTLER, self.throttler.as_str()),
        ];

        all.iter()
            .filter(|(component, _)| which.contains(*component))
            .map(|(_, name)| *name)
            .collect()
    }
}

/// A `pgrep -f` pattern for `name` that does not match the shell running the `pgrep` itself.
pub fn pgrep_pattern(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => format!("[{}]{}", first, chars.as_str()),
        None => String::new(),
    }
}

/// This process and the one that started it. Their command lines often mention a component (e.g.
/// `--runtime /usr/bin/kata-runtime`), so a full command line search finds them too.
pub fn own_pids() -> Vec<u32> {
    vec![std::process::id(), std::os::unix::process::parent_id()]
}

/// Parse `pgrep` output (one process per line, PID first), dropping the PIDs in `exclude`.
pub fn parse_pgrep(stdout: &str, exclude: &[u32]) -> Vec<(u32, String)> {
    output_lines(stdout)
        .into_iter()
        .filter_map(|line| {
            let mut parts = line.splitn(2, ' ');
            let pid: u32 = parts.next()?.parse().ok()?;
            let rest = parts.next().unwrap_or("").to_owned();
            Some((pid, rest))
        })
        .filter(|(pid, _)| !exclude.contains(pid))
        .collect()
}

/// PIDs of the processes whose command line mentions `name`, other than those in `exclude`.
pub fn matching_pids(
    shell: &dyn Execute,
    name: &str,
    exclude: &[u32],
) -> Result<Vec<u32>, failure::Error> {
    let out = shell.run(
        cmd!("pgrep -f '{}'", escape_for_bash(&pgrep_pattern(name))).allow_error(),
    )?;

    Ok(parse_pgrep(&out.stdout, exclude)
        .into_iter()
        .map(|(pid, _)| pid)
        .collect())
}

/// IDs of the running containers.
pub fn running_containers(
    shell: &dyn Execute,
    config: &Config,
) -> Result<Vec<String>, failure::Error> {
    let out = shell.run(cmd!("{} ps -q", config.docker_exe))?;
    Ok(output_lines(&out.stdout))
}

/// Forcibly remove the given containers.
pub fn clean_env(
    shell: &dyn Execute,
    config: &Config,
    containers: &[String],
) -> Result<(), failure::Error> {
    if containers.is_empty() {
        return Ok(());
    }

    info!("removing {} leftover containers", containers.len());
    shell.run(cmd!(
        "sudo {} rm -f {}",
        config.docker_exe,
        containers.join(" ")
    ))?;

    Ok(())
}

/// The names in `names` that still have a matching process, with the PIDs found for each.
pub fn leftover_processes<'n>(
    shell: &dyn Execute,
    names: &[&'n str],
    exclude: &[u32],
) -> Result<Vec<(&'n str, Vec<u32>)>, failure::Error> {
    let mut leftovers = vec![];

    for name in names {
        let pids = matching_pids(shell, name, exclude)?;
        if !pids.is_empty() {
            leftovers.push((*name, pids));
        }
    }

    Ok(leftovers)
}

/// Make sure that no process matching `names` is running, ignoring the PIDs in `exclude`.
/// Leftovers are killed once; anything that survives that is fatal.
pub fn check_processes(
    shell: &dyn Execute,
    names: &[&str],
    exclude: &[u32],
) -> Result<(), failure::Error> {
    let leftovers = leftover_processes(shell, names, exclude)?;
    if leftovers.is_empty() {
        return Ok(());
    }

    let leftover_names: Vec<&str> = leftovers.iter().map(|(name, _)| *name).collect();
    let pids: Vec<String> = leftovers
        .iter()
        .flat_map(|(_, pids)| pids.iter().map(u32::to_string))
        .collect();

    warn!("killing leftover processes: {}", leftover_names.join(", "));

    // Processes may exit on their own before the kill lands.
    shell.run(cmd!("sudo kill -KILL {}", pids.join(" ")).allow_error())?;

    if !shell.is_dry_run() {
        std::thread::sleep(REAP_GRACE);
    }

    let survivors = leftover_processes(shell, &leftover_names, exclude)?;
    if !survivors.is_empty() {
        let survivors: Vec<&str> = survivors.iter().map(|(name, _)| *name).collect();
        return Err(HarnessError::LeftoverProcesses(survivors.join(", ")).into());
    }

    Ok(())
}

/// Remove running containers, then make sure none of the runtime's processes are left. Processes
/// in `exclude` are never touched.
pub fn kill_processes_before_start(
    shell: &dyn Execute,
    config: &Config,
    names: &ProcessNames,
    exclude: &[u32],
) -> Result<(), failure::Error> {
    let containers = running_containers(shell, config)?;
    if !containers.is_empty() {
        clean_env(shell, config, &containers)?;
    }

    check_processes(shell, &names.names(Components::all()), exclude)
}

pub fn cli_options() -> clap::App<'static, 'static> {
    clap_app! { reset =>
        (about: "Remove leftover containers and runtime processes before a test. Requires `sudo`.")
    }
}

pub fn run(
    shell: &dyn Execute,
    config: &Config,
    session: &Session,
    _sub_m: &clap::ArgMatches<'_>,
) -> Result<(), failure::Error> {
    let names = ProcessNames::new(config, session.runtime_env());
    kill_processes_before_start(shell, config, &names, &own_pids())
}
