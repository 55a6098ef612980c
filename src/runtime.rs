//! Runtime-specific setup.

use log::{info, warn};

use serde::{Deserialize, Serialize};

use crate::common::{basename, escape_for_bash, Config, Execute};
use crate::session::Session;

/// The runtimes we know how to set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runtime {
    /// Kata Containers (`kata-runtime`).
    Kata,

    /// Anything else. There is nothing to set up, but tests may still run.
    Unrecognized(String),
}

impl Runtime {
    pub fn from_name(name: &str) -> Self {
        match basename(name) {
            "kata-runtime" => Runtime::Kata,
            _ => Runtime::Unrecognized(name.into()),
        }
    }

    /// Collect whatever the runtime can tell us about its environment.
    pub fn setup(
        &self,
        shell: &dyn Execute,
        config: &Config,
    ) -> Result<Option<RuntimeEnv>, failure::Error> {
        match self {
            Runtime::Kata => extract_kata_env(shell, &config.runtime).map(Some),
            Runtime::Unrecognized(name) => {
                warn!("Unrecognised runtime {}", name);
                Ok(None)
            }
        }
    }
}

/// Paths and versions of the components of the runtime under test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEnv {
    pub config_path: String,
    pub runtime_version: String,
    pub runtime_commit: String,
    pub runtime_path: String,
    pub shim_path: String,
    pub shim_version: String,
    pub proxy_path: String,
    pub proxy_version: String,
    pub hypervisor_path: String,
    pub hypervisor_version: String,
    pub image_path: String,
    pub kernel_path: String,
    pub initrd_path: String,
}

// The parts of `kata-runtime kata-env --json` that we care about.

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct KataEnv {
    runtime: KataRuntime,
    hypervisor: KataComponent,
    proxy: KataComponent,
    shim: KataComponent,
    image: KataComponent,
    kernel: KataComponent,
    initrd: KataComponent,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct KataRuntime {
    path: String,
    config: KataComponent,
    version: KataVersion,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct KataVersion {
    semver: String,
    commit: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct KataComponent {
    path: String,
    version: String,
}

impl From<KataEnv> for RuntimeEnv {
    fn from(env: KataEnv) -> Self {
        RuntimeEnv {
            config_path: env.runtime.config.path,
            runtime_version: env.runtime.version.semver,
            runtime_commit: env.runtime.version.commit,
            runtime_path: env.runtime.path,
            shim_path: env.shim.path,
            shim_version: env.shim.version,
            proxy_path: env.proxy.path,
            proxy_version: env.proxy.version,
            hypervisor_path: env.hypervisor.path,
            hypervisor_version: env.hypervisor.version,
            image_path: env.image.path,
            kernel_path: env.kernel.path,
            initrd_path: env.initrd.path,
        }
    }
}

/// Parse the output of `kata-runtime kata-env --json`.
pub fn parse_kata_env(json: &str) -> Result<RuntimeEnv, failure::Error> {
    let env: KataEnv = serde_json::from_str(json)
        .map_err(|err| failure::format_err!("Unable to parse kata-env output: {}", err))?;
    Ok(env.into())
}

/// Ask `runtime` (a `kata-runtime` binary) to describe its environment.
pub fn extract_kata_env(shell: &dyn Execute, runtime: &str) -> Result<RuntimeEnv, failure::Error> {
    let out = shell.run(cmd!("'{}' kata-env --json", escape_for_bash(runtime)))?;
    let env = parse_kata_env(&out.stdout)?;

    info!("runtime: {} {} ({})", env.runtime_path, env.runtime_version, env.runtime_commit);
    info!("runtime config: {}", env.config_path);
    info!("hypervisor: {} {}", env.hypervisor_path, env.hypervisor_version);
    info!("shim: {} {}", env.shim_path, env.shim_version);
    info!("proxy: {} {}", env.proxy_path, env.proxy_version);
    info!(
        "guest: image={} kernel={} initrd={}",
        env.image_path, env.kernel_path, env.initrd_path
    );

    Ok(env)
}

/// Runtime-specific initialization, run after `init_env`. Unknown runtimes only get a warning.
pub fn common_init(
    shell: &dyn Execute,
    config: &Config,
    session: &mut Session,
) -> Result<(), failure::Error> {
    if let Some(env) = Runtime::from_name(&config.runtime).setup(shell, config)? {
        session.set_runtime_env(env)?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::shell::mock::MockShell;

    const KATA_ENV: &str = r#"{
        "Meta": { "Version": "1.0.23" },
        "Runtime": {
            "Debug": false,
            "Version": { "Semver": "1.11.2", "Commit": "9dfd1a7", "OCI": "1.0.1-dev" },
            "Config": { "Path": "/usr/share/defaults/kata-containers/configuration.toml" },
            "Path": "/usr/bin/kata-runtime"
        },
        "Hypervisor": {
            "MachineType": "pc",
            "Version": "QEMU emulator version 4.1.1",
            "Path": "/usr/bin/qemu-system-x86_64",
            "Debug": false
        },
        "Image": { "Path": "/usr/share/kata-containers/kata-containers.img" },
        "Kernel": { "Path": "/usr/share/kata-containers/vmlinuz.container", "Parameters": "" },
        "Initrd": { "Path": "" },
        "Proxy": { "Type": "kataProxy", "Version": "kata-proxy version 1.11.2", "Path": "/usr/libexec/kata-containers/kata-proxy", "Debug": false },
        "Shim": { "Type": "kataShim", "Version": "kata-shim version 1.11.2", "Path": "/usr/libexec/kata-containers/kata-shim", "Debug": false },
        "Agent": { "Type": "kata", "Debug": false }
    }"#;

    #[test]
    fn runtime_names() {
        assert_eq!(Runtime::from_name("kata-runtime"), Runtime::Kata);
        assert_eq!(Runtime::from_name("/usr/bin/kata-runtime"), Runtime::Kata);
        assert_eq!(
            Runtime::from_name("runc"),
            Runtime::Unrecognized("runc".into())
        );
    }

    #[test]
    fn parses_kata_env() {
        let env = parse_kata_env(KATA_ENV).unwrap();

        assert_eq!(env.runtime_version, "1.11.2");
        assert_eq!(env.runtime_commit, "9dfd1a7");
        assert_eq!(env.runtime_path, "/usr/bin/kata-runtime");
        assert_eq!(
            env.config_path,
            "/usr/share/defaults/kata-containers/configuration.toml"
        );
        assert_eq!(env.hypervisor_path, "/usr/bin/qemu-system-x86_64");
        assert_eq!(env.shim_path, "/usr/libexec/kata-containers/kata-shim");
        assert_eq!(env.proxy_version, "kata-proxy version 1.11.2");
        assert_eq!(env.initrd_path, "");
    }

    #[test]
    fn kata_env_tolerates_missing_sections() {
        let env = parse_kata_env(r#"{ "Runtime": { "Path": "/opt/kata/bin/kata-runtime" } }"#)
            .unwrap();
        assert_eq!(env.runtime_path, "/opt/kata/bin/kata-runtime");
        assert_eq!(env.hypervisor_path, "");

        assert!(parse_kata_env("not json").is_err());
    }

    #[test]
    fn kata_init_stores_env() {
        let shell = MockShell::new().reply("kata-env --json", KATA_ENV);
        let mut session = Session::in_memory();

        common_init(&shell, &Config::default(), &mut session).unwrap();

        assert_eq!(shell.commands(), vec!["'kata-runtime' kata-env --json"]);
        assert_eq!(
            session.runtime_env().map(|env| env.hypervisor_path.as_str()),
            Some("/usr/bin/qemu-system-x86_64")
        );
    }

    #[test]
    fn unknown_runtime_continues() {
        let shell = MockShell::new();
        let mut session = Session::in_memory();
        let config = Config {
            runtime: "runc".into(),
            ..Config::default()
        };

        common_init(&shell, &config, &mut session).unwrap();

        assert!(shell.commands().is_empty());
        assert!(session.runtime_env().is_none());
    }
}
