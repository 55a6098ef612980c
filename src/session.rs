//! The test session: state that lives for the whole of a test run rather than a single step.
//!
//! A session is either in memory (gone when the tool exits) or backed by a JSON file named by
//! `--session` or `HOSTPREP_SESSION`. Child processes inherit `HOSTPREP_SESSION`, so every
//! invocation of the tool made by a test script sees the same session. In a dry run the session
//! file is read but never written.

use std::path::{Path, PathBuf};

use chrono::offset::Local;

use clap::clap_app;

use log::{debug, info};

use serde::{Deserialize, Serialize};

use crate::common::{Config, Execute, HarnessError, SESSION_ENV};
use crate::ksm::KsmSettings;
use crate::runtime::{self, RuntimeEnv};

/// Whether the one-time environment initialization has happened in this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,

    /// Initialized at the given time (RFC 3339).
    Initialized { at: String },
}

/// Everything a session remembers. This is what gets written to the session file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// When `init_env` was first called, if it has been.
    #[serde(default)]
    pub initialized_at: Option<String>,

    /// KSM settings captured by `ksm save`.
    #[serde(default)]
    pub ksm_saved: Option<KsmSettings>,

    /// The environment reported by the runtime under test.
    #[serde(default)]
    pub runtime_env: Option<RuntimeEnv>,
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    path: Option<PathBuf>,
    dry_run: bool,
}

impl Session {
    /// A session that is not persisted anywhere.
    pub fn in_memory() -> Self {
        Session {
            state: SessionState::default(),
            path: None,
            dry_run: false,
        }
    }

    /// Open the session stored at `path`. A missing or empty file is a fresh session.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, failure::Error> {
        let path = path.into();

        let state = match std::fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => SessionState::default(),
            Ok(contents) => serde_json::from_str(&contents).map_err(|err| {
                failure::format_err!("Unable to parse session file {}: {}", path.display(), err)
            })?,
            Err(ref err) if err.kind() == std::io::ErrorKind::NotFound => SessionState::default(),
            Err(err) => return Err(err.into()),
        };

        Ok(Session {
            state,
            path: Some(path),
            dry_run: false,
        })
    }

    /// Open the session named by `HOSTPREP_SESSION`, or an in-memory one if it is not set.
    pub fn from_env() -> Result<Self, failure::Error> {
        match std::env::var(SESSION_ENV) {
            Ok(ref path) if !path.is_empty() => Self::open(path),
            _ => Ok(Self::in_memory()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_ref().map(PathBuf::as_path)
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Keep changes in memory only.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    fn save(&self) -> Result<(), failure::Error> {
        if let Some(path) = &self.path {
            if self.dry_run {
                debug!("(dry run) not saving session to {}", path.display());
                return Ok(());
            }

            let contents = serde_json::to_string_pretty(&self.state)?;
            std::fs::write(path, contents)?;
        }
        Ok(())
    }

    pub fn init_state(&self) -> InitState {
        match &self.state.initialized_at {
            Some(at) => InitState::Initialized { at: at.clone() },
            None => InitState::Uninitialized,
        }
    }

    /// Restart the container engine. This may only happen once per session: the session is
    /// marked initialized before the restart is attempted, and every later call fails, whether or
    /// not the first one succeeded.
    pub fn init_env(&mut self, shell: &dyn Execute, config: &Config) -> Result<(), failure::Error> {
        if let InitState::Initialized { at } = self.init_state() {
            return Err(HarnessError::AlreadyInitialized(at).into());
        }

        self.state.initialized_at = Some(Local::now().to_rfc3339());
        self.save()?;

        restart_engine_service(shell, config)
    }

    pub fn ksm_saved(&self) -> Option<KsmSettings> {
        self.state.ksm_saved
    }

    pub fn set_ksm_saved(&mut self, settings: KsmSettings) -> Result<(), failure::Error> {
        self.state.ksm_saved = Some(settings);
        self.save()
    }

    pub fn runtime_env(&self) -> Option<&RuntimeEnv> {
        self.state.runtime_env.as_ref()
    }

    pub fn set_runtime_env(&mut self, env: RuntimeEnv) -> Result<(), failure::Error> {
        self.state.runtime_env = Some(env);
        self.save()
    }
}

/// Restart the container engine through the service manager.
pub fn restart_engine_service(shell: &dyn Execute, config: &Config) -> Result<(), failure::Error> {
    let service = config.engine_service();
    info!("restarting {} service", service);
    shell.run(cmd!("sudo systemctl restart {}", service))?;
    Ok(())
}

pub fn cli_options() -> clap::App<'static, 'static> {
    clap_app! { init =>
        (about: "Initialize the host for a test session: restart the container engine and \
                 collect the environment of the runtime. May only run once per session. \
                 Requires `sudo`.")
    }
}

pub fn run(
    shell: &dyn Execute,
    config: &Config,
    session: &mut Session,
    _sub_m: &clap::ArgMatches<'_>,
) -> Result<(), failure::Error> {
    session.init_env(shell, config)?;
    runtime::common_init(shell, config, session)?;

    if let Some(path) = session.path() {
        info!("session state saved to {}", path.display());
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::shell::mock::MockShell;

    fn scratch_file(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "hostprep-session-{}-{}.json",
            std::process::id(),
            name
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn init_restarts_engine_once() {
        let shell = MockShell::new();
        let mut session = Session::in_memory();
        assert_eq!(session.init_state(), InitState::Uninitialized);

        session.init_env(&shell, &Config::default()).unwrap();

        assert_eq!(shell.commands(), vec!["sudo systemctl restart docker"]);
        match session.init_state() {
            InitState::Initialized { at } => assert!(!at.is_empty()),
            InitState::Uninitialized => panic!("session should be initialized"),
        }
    }

    #[test]
    fn second_init_is_fatal() {
        let shell = MockShell::new();
        let mut session = Session::in_memory();

        session.init_env(&shell, &Config::default()).unwrap();
        let err = session.init_env(&shell, &Config::default()).unwrap_err();

        match err.downcast_ref::<HarnessError>() {
            Some(HarnessError::AlreadyInitialized(_)) => {}
            other => panic!("unexpected error {:?}", other),
        }
        // The engine was only restarted the first time.
        assert_eq!(shell.matching("systemctl").len(), 1);
    }

    #[test]
    fn second_init_is_fatal_after_failed_first() {
        let shell = MockShell::new().fail("systemctl restart");
        let mut session = Session::in_memory();

        assert!(session.init_env(&shell, &Config::default()).is_err());
        let err = session.init_env(&shell, &Config::default()).unwrap_err();

        assert!(err.downcast_ref::<HarnessError>().map_or(false, |e| match e {
            HarnessError::AlreadyInitialized(_) => true,
            _ => false,
        }));
        assert_eq!(shell.matching("systemctl").len(), 1);
    }

    #[test]
    fn engine_service_follows_engine_binary() {
        let shell = MockShell::new();
        let config = Config {
            docker_exe: "/usr/bin/podman".into(),
            ..Config::default()
        };

        restart_engine_service(&shell, &config).unwrap();

        assert_eq!(shell.commands(), vec!["sudo systemctl restart podman"]);
    }

    #[test]
    fn init_token_survives_reopening() {
        let path = scratch_file("reopen");
        let shell = MockShell::new();

        Session::open(&path)
            .unwrap()
            .init_env(&shell, &Config::default())
            .unwrap();

        // A later invocation in the same session.
        let mut session = Session::open(&path).unwrap();
        assert!(session.init_env(&shell, &Config::default()).is_err());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn dry_run_init_leaves_session_file_alone() {
        let path = scratch_file("dry");

        let mut session = Session::open(&path).unwrap();
        session.set_dry_run(true);
        session
            .init_env(&MockShell::dry_run(), &Config::default())
            .unwrap();
        // Still only once per process.
        assert!(session
            .init_env(&MockShell::dry_run(), &Config::default())
            .is_err());
        assert!(!path.exists());

        // The real run afterwards is the first one.
        let shell = MockShell::new();
        Session::open(&path)
            .unwrap()
            .init_env(&shell, &Config::default())
            .unwrap();
        assert_eq!(shell.commands(), vec!["sudo systemctl restart docker"]);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn ksm_snapshot_is_persisted() {
        let path = scratch_file("ksm");
        let settings = KsmSettings {
            run: 1,
            pages_to_scan: 100,
            sleep_millisecs: 20,
        };

        Session::open(&path)
            .unwrap()
            .set_ksm_saved(settings)
            .unwrap();

        let session = Session::open(&path).unwrap();
        assert_eq!(session.ksm_saved(), Some(settings));
        assert_eq!(session.init_state(), InitState::Uninitialized);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn empty_or_missing_file_is_fresh() {
        let path = scratch_file("empty");
        assert_eq!(*Session::open(&path).unwrap().state(), SessionState::default());

        std::fs::write(&path, "\n").unwrap();
        assert_eq!(*Session::open(&path).unwrap().state(), SessionState::default());

        std::fs::write(&path, "{ not json").unwrap();
        assert!(Session::open(&path).is_err());

        std::fs::remove_file(&path).unwrap();
    }
}
