use std::path::{Path, PathBuf};

use sluice_config::{ContainerConfig, Isolation};

use crate::sandbox::Sandbox;

/// A fully resolved command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
  pub program: String,
  pub args: Vec<String>,
  pub cwd: PathBuf,
}

/// What to run inside one sandbox.
pub(crate) struct Launch<'a> {
  pub image: &'a Path,
  pub app: Option<&'a str>,
  pub driver: &'a str,
  pub args: &'a [String],
  pub inputs: &'a [String],
  pub outputs: &'a [String],
}

impl Invocation {
  /// Build the command line for `launch` in `sandbox`. Input and output names
  /// are rewritten to the paths the driver sees: bind mounts inside a
  /// container, sandbox directories on the host.
  pub(crate) fn build(config: &ContainerConfig, launch: &Launch<'_>, sandbox: &Sandbox) -> Self {
    match config.isolation {
      Isolation::Singularity => Self::singularity(config, launch, sandbox),
      Isolation::Host => Self::host(launch, sandbox),
    }
  }

  fn singularity(config: &ContainerConfig, launch: &Launch<'_>, sandbox: &Sandbox) -> Self {
    let binds = format!(
      "{}:{},{}:{}",
      sandbox.input_dir().display(),
      config.input_mount,
      sandbox.output_dir().display(),
      config.output_mount
    );

    // An app's runscript is its driver.
    let verb = if launch.app.is_some() { "run" } else { "exec" };
    let mut args = vec![
      verb.to_string(),
      "--contain".to_string(),
      "--cleanenv".to_string(),
      "-B".to_string(),
      binds,
    ];
    if let Some(app) = launch.app {
      args.push("--app".to_string());
      args.push(app.to_string());
    }
    args.extend(config.extra_args.iter().cloned());
    args.push(launch.image.display().to_string());
    if launch.app.is_none() {
      args.push(launch.driver.to_string());
    }
    args.extend(launch.args.iter().cloned());
    args.extend(
      launch
        .inputs
        .iter()
        .map(|name| format!("{}/{}", config.input_mount, name)),
    );
    args.extend(
      launch
        .outputs
        .iter()
        .map(|name| format!("{}/{}", config.output_mount, name)),
    );

    Self {
      program: config.program.clone(),
      args,
      cwd: sandbox.root().to_path_buf(),
    }
  }

  fn host(launch: &Launch<'_>, sandbox: &Sandbox) -> Self {
    let mut args: Vec<String> = launch.args.to_vec();
    args.extend(
      launch
        .inputs
        .iter()
        .map(|name| sandbox.input_dir().join(name).display().to_string()),
    );
    args.extend(
      launch
        .outputs
        .iter()
        .map(|name| sandbox.output_dir().join(name).display().to_string()),
    );

    Self {
      program: launch.driver.to_string(),
      args,
      cwd: sandbox.root().to_path_buf(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn launch<'a>(app: Option<&'a str>, inputs: &'a [String], outputs: &'a [String]) -> Launch<'a> {
    Launch {
      image: Path::new("/images/tools.simg"),
      app,
      driver: "/usr/local/bin/sort.sh",
      args: &[],
      inputs,
      outputs,
    }
  }

  #[test]
  fn test_singularity_invocation() {
    let config = ContainerConfig::default();
    let sandbox = Sandbox::at("/sandboxes/t1");
    let inputs = vec!["raw.txt".to_string()];
    let outputs = vec!["sorted.txt".to_string()];
    let inv = Invocation::build(&config, &launch(None, &inputs, &outputs), &sandbox);

    assert_eq!(inv.program, "singularity");
    assert_eq!(
      inv.args,
      vec![
        "exec",
        "--contain",
        "--cleanenv",
        "-B",
        "/sandboxes/t1/input:/mnt/input,/sandboxes/t1/output:/mnt/output",
        "/images/tools.simg",
        "/usr/local/bin/sort.sh",
        "/mnt/input/raw.txt",
        "/mnt/output/sorted.txt",
      ]
    );
    assert_eq!(inv.cwd, PathBuf::from("/sandboxes/t1"));
  }

  #[test]
  fn test_singularity_app_uses_runscript() {
    let config = ContainerConfig::default();
    let sandbox = Sandbox::at("/sandboxes/t1");
    let inv = Invocation::build(&config, &launch(Some("sort"), &[], &[]), &sandbox);
    assert_eq!(inv.args[0], "run");
    assert!(inv.args.windows(2).any(|w| w == ["--app", "sort"]));
    assert!(!inv.args.contains(&"/usr/local/bin/sort.sh".to_string()));
  }

  #[test]
  fn test_host_invocation_uses_sandbox_paths() {
    let config = ContainerConfig {
      isolation: Isolation::Host,
      ..Default::default()
    };
    let sandbox = Sandbox::at("/sandboxes/t1");
    let inputs = vec!["raw.txt".to_string()];
    let outputs = vec!["sorted.txt".to_string()];
    let inv = Invocation::build(&config, &launch(None, &inputs, &outputs), &sandbox);
    assert_eq!(inv.program, "/usr/local/bin/sort.sh");
    assert_eq!(
      inv.args,
      vec!["/sandboxes/t1/input/raw.txt", "/sandboxes/t1/output/sorted.txt"]
    );
  }
}
