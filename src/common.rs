//! Definitions and routines shared by all of the subcommands.

#[macro_use]
mod macros;

pub mod shell;

use failure::Fail;

pub use self::shell::Execute;
pub use spurs::util::escape_for_bash;

/// The runtime under test if `RUNTIME` is not set.
pub const DEFAULT_RUNTIME: &str = "kata-runtime";

/// The container engine binary if `DOCKER_EXE` is not set.
pub const DEFAULT_DOCKER_EXE: &str = "docker";

/// The KSM control directory.
pub const KSM_BASE: &str = "/sys/kernel/mm/ksm";

/// Environment variable naming the session file. Child processes inherit it, so every tool
/// invocation in a test session shares the same session state.
pub const SESSION_ENV: &str = "HOSTPREP_SESSION";

/// Fatal conditions. Anything that reaches `main` ends the run with a non-zero exit status.
#[derive(Debug, Fail)]
pub enum HarnessError {
    #[fail(display = "command {} not available", _0)]
    MissingCommand(String),

    #[fail(display = "`{}` exited with status {:?}: {}", cmd, exit, stderr)]
    NonZeroExit {
        cmd: String,
        exit: Option<i32>,
        stderr: String,
    },

    #[fail(display = "Failed to pull image {}", _0)]
    PullFailed(String),

    #[fail(display = "Failed to build image {}", _0)]
    BuildFailed(String),

    #[fail(display = "Found unexpected processes still running: {}", _0)]
    LeftoverProcesses(String),

    #[fail(
        display = "init_env called more than once in this session (first call at {}); \
                   it must only run once per session",
        _0
    )]
    AlreadyInitialized(String),

    #[fail(display = "No saved KSM settings to restore")]
    NoSavedKsmSettings,

    #[fail(display = "Unexpected value {:?} in {}", value, file)]
    BadKsmValue { file: String, value: String },
}

/// Host-wide settings, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The runtime binary under test (e.g. `kata-runtime`).
    pub runtime: String,

    /// The container engine binary (e.g. `docker`).
    pub docker_exe: String,

    /// Proxies forwarded to image builds, if set.
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,

    /// The KSM control directory.
    pub ksm_base: String,
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build the configuration from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.is_empty());

        Config {
            runtime: get("RUNTIME").unwrap_or_else(|| DEFAULT_RUNTIME.into()),
            docker_exe: get("DOCKER_EXE").unwrap_or_else(|| DEFAULT_DOCKER_EXE.into()),
            http_proxy: get("http_proxy"),
            https_proxy: get("https_proxy"),
            ksm_base: KSM_BASE.into(),
        }
    }

    /// The service manager unit of the container engine: the basename of the engine binary.
    pub fn engine_service(&self) -> &str {
        basename(&self.docker_exe)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// The last component of a `/`-separated path.
pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// Split command output into its non-empty, trimmed lines.
pub fn output_lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.runtime, "kata-runtime");
        assert_eq!(config.docker_exe, "docker");
        assert_eq!(config.http_proxy, None);
        assert_eq!(config.ksm_base, "/sys/kernel/mm/ksm");
    }

    #[test]
    fn config_overrides() {
        let config = Config::from_lookup(|var| match var {
            "RUNTIME" => Some("runc".into()),
            "DOCKER_EXE" => Some("/usr/local/bin/podman".into()),
            "https_proxy" => Some("http://proxy:3128".into()),
            "http_proxy" => Some("".into()),
            _ => None,
        });

        assert_eq!(config.runtime, "runc");
        assert_eq!(config.engine_service(), "podman");
        assert_eq!(config.http_proxy, None);
        assert_eq!(config.https_proxy.as_deref(), Some("http://proxy:3128"));
    }

    #[test]
    fn basename_and_lines() {
        assert_eq!(basename("/usr/bin/qemu-system-x86_64"), "qemu-system-x86_64");
        assert_eq!(basename("docker"), "docker");
        assert_eq!(output_lines("a\n\n  b \n"), vec!["a", "b"]);
        assert!(output_lines("\n").is_empty());
    }
}
