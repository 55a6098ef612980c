//! Control KSM (kernel same-page merging) through its sysfs knobs.
//!
//! KSM scan settings are treated as a single value, `KsmSettings`. Tests save the host's settings,
//! switch to aggressive scanning, and put the saved settings back afterwards. Every write is a
//! single privileged write of one value to one control file.

use clap::clap_app;

use log::info;

use serde::{Deserialize, Serialize};

use crate::common::{escape_for_bash, Config, Execute, HarnessError};
use crate::session::Session;

/// Pages to scan per wake-up in aggressive mode.
pub const AGGRESSIVE_PAGES: u64 = 1000;

/// Milliseconds to sleep between scans in aggressive mode.
pub const AGGRESSIVE_SLEEP_MS: u64 = 50;

/// The scan settings of KSM.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KsmSettings {
    /// Contents of `run`: 0 stops scanning, 1 scans, 2 unmerges everything.
    pub run: u32,

    /// Contents of `pages_to_scan`.
    pub pages_to_scan: u64,

    /// Contents of `sleep_millisecs`.
    pub sleep_millisecs: u64,
}

impl KsmSettings {
    /// Scan fast, so that merging settles quickly during a test.
    pub const AGGRESSIVE: KsmSettings = KsmSettings {
        run: 1,
        pages_to_scan: AGGRESSIVE_PAGES,
        sleep_millisecs: AGGRESSIVE_SLEEP_MS,
    };
}

/// The KSM control files under some base directory (normally `/sys/kernel/mm/ksm`).
#[derive(Debug, Clone)]
pub struct Ksm {
    run: String,
    pages_to_scan: String,
    sleep_millisecs: String,
}

impl Ksm {
    pub fn new(base: &str) -> Self {
        Ksm {
            run: dir!(base, "run"),
            pages_to_scan: dir!(base, "pages_to_scan"),
            sleep_millisecs: dir!(base, "sleep_millisecs"),
        }
    }

    /// Read the current settings, each from its own file. A dry run reads nothing and gets all
    /// zeros.
    pub fn save(&self, shell: &dyn Execute) -> Result<KsmSettings, failure::Error> {
        info!("saving KSM settings");

        let settings = KsmSettings {
            run: read_value(shell, &self.run)?,
            pages_to_scan: read_value(shell, &self.pages_to_scan)?,
            sleep_millisecs: read_value(shell, &self.sleep_millisecs)?,
        };

        info!("saved KSM settings: {:?}", settings);

        Ok(settings)
    }

    /// Stop KSM, write the scan parameters, then write the `run` value. Cycling `run` makes KSM
    /// start a fresh scan with the new parameters instead of finishing the current one.
    pub fn apply(&self, shell: &dyn Execute, settings: &KsmSettings) -> Result<(), failure::Error> {
        with_shell! { shell =>
            write_value(&self.run, 0),
            write_value(&self.pages_to_scan, settings.pages_to_scan),
            write_value(&self.sleep_millisecs, settings.sleep_millisecs),
            write_value(&self.run, settings.run),
        }

        Ok(())
    }

    pub fn set_aggressive(&self, shell: &dyn Execute) -> Result<(), failure::Error> {
        info!("setting KSM to aggressive mode");
        self.apply(shell, &KsmSettings::AGGRESSIVE)
    }

    pub fn restore(&self, shell: &dyn Execute, saved: &KsmSettings) -> Result<(), failure::Error> {
        info!("restoring KSM settings: {:?}", saved);
        self.apply(shell, saved)
    }

    /// Stop KSM. The scan parameters are left alone.
    pub fn disable(&self, shell: &dyn Execute) -> Result<(), failure::Error> {
        info!("disabling KSM");
        shell.run(write_value(&self.run, 0))?;
        Ok(())
    }
}

fn write_value<V: std::fmt::Display>(file: &str, value: V) -> crate::common::shell::Cmd {
    cmd!("echo {} | sudo tee '{}' > /dev/null", value, escape_for_bash(file))
}

fn read_value<V>(shell: &dyn Execute, file: &str) -> Result<V, failure::Error>
where
    V: std::str::FromStr + Default,
{
    let out = shell.run(cmd!("cat '{}'", escape_for_bash(file)))?;
    if shell.is_dry_run() {
        return Ok(V::default());
    }

    let value = out.stdout.trim();

    value.parse().map_err(|_| {
        HarnessError::BadKsmValue {
            file: file.into(),
            value: value.into(),
        }
        .into()
    })
}

pub fn cli_options() -> clap::App<'static, 'static> {
    clap_app! { ksm =>
        (about: "Save, tune, restore or disable KSM. Requires `sudo`.")
        (@arg ACTION: +required +takes_value
            possible_value[save aggressive restore disable]
         "save: snapshot the current settings into the session. \
          aggressive: scan 1000 pages every 50ms. \
          restore: put back the saved settings. \
          disable: stop KSM.")
    }
}

pub fn run(
    shell: &dyn Execute,
    config: &Config,
    session: &mut Session,
    sub_m: &clap::ArgMatches<'_>,
) -> Result<(), failure::Error> {
    let ksm = Ksm::new(&config.ksm_base);

    match sub_m.value_of("ACTION").unwrap() {
        "save" => {
            let settings = ksm.save(shell)?;
            session.set_ksm_saved(settings)?;
        }
        "aggressive" => ksm.set_aggressive(shell)?,
        "restore" => {
            let saved = session.ksm_saved().ok_or(HarnessError::NoSavedKsmSettings)?;
            ksm.restore(shell, &saved)?;
        }
        "disable" => ksm.disable(shell)?,
        _ => unreachable!(),
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::shell::mock::MockShell;

    const BASE: &str = "/sys/kernel/mm/ksm";

    fn writes(shell: &MockShell) -> Vec<String> {
        shell.matching("tee")
    }

    #[test]
    fn save_reads_each_file() {
        let shell = MockShell::new()
            .reply("cat '/sys/kernel/mm/ksm/run'", "1\n")
            .reply("cat '/sys/kernel/mm/ksm/pages_to_scan'", "100\n")
            .reply("cat '/sys/kernel/mm/ksm/sleep_millisecs'", "20\n");

        let settings = Ksm::new(BASE).save(&shell).unwrap();

        assert_eq!(
            settings,
            KsmSettings {
                run: 1,
                pages_to_scan: 100,
                sleep_millisecs: 20,
            }
        );
        assert_eq!(
            shell.commands(),
            vec![
                "cat '/sys/kernel/mm/ksm/run'",
                "cat '/sys/kernel/mm/ksm/pages_to_scan'",
                "cat '/sys/kernel/mm/ksm/sleep_millisecs'",
            ]
        );
    }

    #[test]
    fn save_rejects_garbage() {
        let shell = MockShell::new().reply("cat", "not a number\n");
        let err = Ksm::new(BASE).save(&shell).unwrap_err();
        assert!(err.to_string().contains("/sys/kernel/mm/ksm/run"));
    }

    #[test]
    fn aggressive_write_order() {
        // Whatever the current contents, the writes are the same.
        let shell = MockShell::new().reply("cat", "7\n");

        Ksm::new(BASE).set_aggressive(&shell).unwrap();

        assert_eq!(
            writes(&shell),
            vec![
                "echo 0 | sudo tee '/sys/kernel/mm/ksm/run' > /dev/null",
                "echo 1000 | sudo tee '/sys/kernel/mm/ksm/pages_to_scan' > /dev/null",
                "echo 50 | sudo tee '/sys/kernel/mm/ksm/sleep_millisecs' > /dev/null",
                "echo 1 | sudo tee '/sys/kernel/mm/ksm/run' > /dev/null",
            ]
        );
        assert_eq!(shell.commands().len(), 4);
    }

    #[test]
    fn restore_reapplies_snapshot() {
        let shell = MockShell::new();
        let saved = KsmSettings {
            run: 0,
            pages_to_scan: 100,
            sleep_millisecs: 20,
        };

        Ksm::new("/tmp/ksm/").restore(&shell, &saved).unwrap();

        assert_eq!(
            writes(&shell),
            vec![
                "echo 0 | sudo tee '/tmp/ksm/run' > /dev/null",
                "echo 100 | sudo tee '/tmp/ksm/pages_to_scan' > /dev/null",
                "echo 20 | sudo tee '/tmp/ksm/sleep_millisecs' > /dev/null",
                "echo 0 | sudo tee '/tmp/ksm/run' > /dev/null",
            ]
        );
    }

    #[test]
    fn disable_only_touches_run() {
        let shell = MockShell::new();
        Ksm::new(BASE).disable(&shell).unwrap();
        assert_eq!(
            shell.commands(),
            vec!["echo 0 | sudo tee '/sys/kernel/mm/ksm/run' > /dev/null"]
        );
    }

    #[test]
    fn failed_write_stops_sequence() {
        let shell = MockShell::new().fail("pages_to_scan");

        assert!(Ksm::new(BASE).set_aggressive(&shell).is_err());

        // KSM was stopped, but never restarted with half-applied settings.
        assert_eq!(writes(&shell).len(), 2);
        assert!(!shell.ran("echo 1 |"));
    }

    #[test]
    fn restore_without_save_is_fatal() {
        let shell = MockShell::new();
        let mut session = Session::in_memory();
        let matches = cli_options().get_matches_from(vec!["ksm", "restore"]);

        let err = run(&shell, &Config::default(), &mut session, &matches).unwrap_err();

        assert_eq!(err.to_string(), "No saved KSM settings to restore");
        assert!(shell.commands().is_empty());
    }

    #[test]
    fn save_then_restore_through_session() {
        let shell = MockShell::new()
            .reply("cat '/sys/kernel/mm/ksm/run'", "1\n")
            .reply("cat '/sys/kernel/mm/ksm/pages_to_scan'", "64\n")
            .reply("cat '/sys/kernel/mm/ksm/sleep_millisecs'", "200\n");
        let mut session = Session::in_memory();
        let config = Config::default();

        for action in &["save", "aggressive", "restore"] {
            let matches = cli_options().get_matches_from(vec!["ksm", *action]);
            run(&shell, &config, &mut session, &matches).unwrap();
        }

        let writes = writes(&shell);
        assert_eq!(writes.len(), 8);
        assert_eq!(
            &writes[4..],
            &[
                "echo 0 | sudo tee '/sys/kernel/mm/ksm/run' > /dev/null",
                "echo 64 | sudo tee '/sys/kernel/mm/ksm/pages_to_scan' > /dev/null",
                "echo 200 | sudo tee '/sys/kernel/mm/ksm/sleep_millisecs' > /dev/null",
                "echo 1 | sudo tee '/sys/kernel/mm/ksm/run' > /dev/null",
            ]
        );
    }

    #[test]
    fn dry_run_save_does_not_parse() {
        let shell = MockShell::dry_run();
        let mut session = Session::in_memory();
        session.set_dry_run(true);
        let matches = cli_options().get_matches_from(vec!["ksm", "save"]);

        run(&shell, &Config::default(), &mut session, &matches).unwrap();

        assert_eq!(session.ksm_saved(), Some(KsmSettings::default()));
        assert_eq!(shell.matching("cat").len(), 3);
    }
}
