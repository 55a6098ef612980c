//! Keep container images up to date: pull the ones from a registry, and rebuild the ones built
//! from a local Dockerfile whenever the Dockerfile's declared version moves past the version
//! baked into the cached image.

use std::path::Path;

use log::{info, warn};

use crate::common::{escape_for_bash, output_lines, Config, Execute, HarnessError};

/// The label (and Dockerfile marker) carrying the image version.
pub const VERSION_MARKER: &str = "DOCKERFILE_VERSION";

pub fn pull_cli_options() -> clap::App<'static, 'static> {
    clap::SubCommand::with_name("pull-images")
        .about("Pull the given images with the container engine. Requires `sudo`.")
        .arg(
            clap::Arg::with_name("IMAGES")
                .required(true)
                .multiple(true)
                .help("The images to pull (e.g. busybox:latest)"),
        )
}

pub fn check_cli_options() -> clap::App<'static, 'static> {
    clap::SubCommand::with_name("check-image")
        .about(
            "Rebuild the given image from its Dockerfile if the cached image is missing or out \
             of date. Requires `sudo`.",
        )
        .arg(
            clap::Arg::with_name("IMAGE")
                .required(true)
                .help("The tag of the image (e.g. local-fio:latest)"),
        )
        .arg(
            clap::Arg::with_name("DOCKERFILE")
                .required(true)
                .help("Path to the Dockerfile. Its directory is the build context."),
        )
}

pub fn run_pull(
    shell: &dyn Execute,
    config: &Config,
    sub_m: &clap::ArgMatches<'_>,
) -> Result<(), failure::Error> {
    let images: Vec<&str> = sub_m.values_of("IMAGES").unwrap().collect();
    pull_images(shell, config, &images)
}

pub fn run_check(
    shell: &dyn Execute,
    config: &Config,
    sub_m: &clap::ArgMatches<'_>,
) -> Result<(), failure::Error> {
    let image = sub_m.value_of("IMAGE").unwrap();
    let dockerfile = sub_m.value_of("DOCKERFILE").unwrap();
    check_dockerfile_image(shell, config, image, dockerfile)
}

/// Pull every image in `images`. Any failed pull is fatal.
pub fn pull_images<S: AsRef<str>>(
    shell: &dyn Execute,
    config: &Config,
    images: &[S],
) -> Result<(), failure::Error> {
    for image in images.iter().map(AsRef::as_ref) {
        info!("{} pull {}", config.docker_exe, image);
        shell
            .run(cmd!(
                "sudo {} pull '{}'",
                config.docker_exe,
                escape_for_bash(image)
            ))
            .map_err(|_| HarnessError::PullFailed(image.into()))?;
    }

    Ok(())
}

/// Pull the declared version out of a Dockerfile: the text between the first pair of double
/// quotes on the first line mentioning `DOCKERFILE_VERSION`.
pub fn descriptor_version(dockerfile: &str) -> Option<&str> {
    let line = dockerfile.lines().find(|l| l.contains(VERSION_MARKER))?;
    line.split('"').nth(1)
}

/// Why an image needs to be (re)built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    /// There is no cached image.
    Missing,

    /// The cached image carries no version label.
    Unlabeled,

    /// The versions of the cached image and the Dockerfile differ.
    Outdated {
        cached: String,
        declared: Option<String>,
    },
}

/// Compare the cached image against `dockerfile`. Returns `None` if the image is fresh.
pub fn image_staleness(
    shell: &dyn Execute,
    config: &Config,
    image: &str,
    dockerfile: &str,
) -> Result<Option<Staleness>, failure::Error> {
    let ids = shell.run(cmd!(
        "{} images -q '{}'",
        config.docker_exe,
        escape_for_bash(image)
    ))?;
    if output_lines(&ids.stdout).is_empty() {
        return Ok(Some(Staleness::Missing));
    }

    let label = shell.run(cmd!(
        "{} image inspect --format '{{{{.Config.Labels.{}}}}}' '{}'",
        config.docker_exe,
        VERSION_MARKER,
        escape_for_bash(image)
    ))?;
    let cached = label.stdout.trim();
    if cached.is_empty() || cached == "<no value>" {
        return Ok(Some(Staleness::Unlabeled));
    }

    let contents = shell.run(cmd!("cat '{}'", escape_for_bash(dockerfile)))?;
    let declared = descriptor_version(&contents.stdout);
    if declared == Some(cached) {
        return Ok(None);
    }

    Ok(Some(Staleness::Outdated {
        cached: cached.into(),
        declared: declared.map(str::to_owned),
    }))
}

/// Make sure the cached `image` is built from the current version of `dockerfile`, rebuilding it
/// if not.
pub fn check_dockerfile_image(
    shell: &dyn Execute,
    config: &Config,
    image: &str,
    dockerfile: &str,
) -> Result<(), failure::Error> {
    match image_staleness(shell, config, image, dockerfile)? {
        None => {
            info!("image {} is up to date", image);
            return Ok(());
        }
        Some(Staleness::Missing) => info!("image {} not found, building it", image),
        Some(Staleness::Unlabeled) => {
            info!("image {} has no {} label, rebuilding", image, VERSION_MARKER)
        }
        Some(Staleness::Outdated {
            cached,
            declared: Some(declared),
        }) => info!(
            "image {} is version {}, {} declares {}, rebuilding",
            image, cached, dockerfile, declared
        ),
        Some(Staleness::Outdated {
            declared: None, ..
        }) => warn!(
            "{} has no {} marker, rebuilding {}",
            dockerfile, VERSION_MARKER, image
        ),
    }

    build_image(shell, config, image, dockerfile)
}

/// Build `image` from `dockerfile`, using the Dockerfile's directory as the build context.
pub fn build_image(
    shell: &dyn Execute,
    config: &Config,
    image: &str,
    dockerfile: &str,
) -> Result<(), failure::Error> {
    let context = match Path::new(dockerfile).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_string_lossy().into_owned(),
        _ => ".".into(),
    };

    let mut build_args = String::new();
    for (name, value) in [
        ("http_proxy", &config.http_proxy),
        ("https_proxy", &config.https_proxy),
    ]
    .iter()
    {
        if let Some(value) = value {
            build_args.push_str(&format!(
                "--build-arg '{}' ",
                escape_for_bash(&format!("{}={}", name, value))
            ));
        }
    }

    info!("{} build {}", config.docker_exe, image);
    shell
        .run(cmd!(
            "sudo {} build {}--label '{}' --tag '{}' -f '{}' '{}'",
            config.docker_exe,
            build_args,
            escape_for_bash(image),
            escape_for_bash(image),
            escape_for_bash(dockerfile),
            escape_for_bash(&context),
        ))
        .map_err(|_| HarnessError::BuildFailed(image.into()))?;

    Ok(())
}
