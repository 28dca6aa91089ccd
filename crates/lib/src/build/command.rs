//! Child-process build executor.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use tracing::{debug, info};

use super::{BuildContext, BuildExecutor, BuildStepError};
use crate::component::{BuildStep, Component};
use crate::placeholder::substitute;

/// January 1, 1980 00:00:00 UTC, the ZIP epoch.
const SOURCE_DATE_EPOCH: &str = "315532800";

/// Runs each step as a child process.
///
/// The step command is executed directly, not through a shell; recipes that
/// need one spell it out (`/bin/sh -c ...`). Each process inherits the host
/// environment plus:
///
/// - `STACKWRIGHT_NAME`, `STACKWRIGHT_VERSION`
/// - `STACKWRIGHT_INSTALL_DIR`, `STACKWRIGHT_SOURCE_DIR`, `STACKWRIGHT_BUILD_DIR`
/// - `TMPDIR`/`TMP`/`TEMP` pointing into the build directory
/// - `SOURCE_DATE_EPOCH` for reproducible timestamps
///
/// Step `env` entries are applied last and win. The working directory
/// defaults to the source path; a relative `cwd` is resolved against it.
#[derive(Debug, Default, Clone)]
pub struct CommandExecutor;

impl CommandExecutor {
  pub fn new() -> Self {
    Self
  }

  fn run_step(&self, component: &str, index: usize, step: &BuildStep, ctx: &BuildContext) -> Result<(), BuildStepError> {
    let placeholder_err = |source| BuildStepError::Placeholder {
      component: component.to_string(),
      index,
      source,
    };

    let program = substitute(&step.command, ctx).map_err(placeholder_err)?;
    let args = step
      .args
      .iter()
      .map(|arg| substitute(arg, ctx))
      .collect::<Result<Vec<_>, _>>()
      .map_err(placeholder_err)?;

    let working_dir = match &step.options.cwd {
      Some(cwd) => ctx.source_path().join(substitute(cwd, ctx).map_err(placeholder_err)?),
      None => ctx.source_path().to_path_buf(),
    };

    let tmp_dir = ctx.build_dir().join("tmp");
    let mut command = Command::new(&program);
    command
      .args(&args)
      .current_dir(&working_dir)
      .env("STACKWRIGHT_NAME", ctx.name())
      .env("STACKWRIGHT_VERSION", ctx.version())
      .env("STACKWRIGHT_INSTALL_DIR", ctx.install_root())
      .env("STACKWRIGHT_SOURCE_DIR", ctx.source_path())
      .env("STACKWRIGHT_BUILD_DIR", ctx.build_dir())
      .env("TMPDIR", &tmp_dir)
      .env("TMP", &tmp_dir)
      .env("TEMP", &tmp_dir)
      .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH);

    for (key, value) in &step.options.env {
      command.env(key, substitute(value, ctx).map_err(placeholder_err)?);
    }

    let rendered = std::iter::once(program.as_str())
      .chain(args.iter().map(String::as_str))
      .collect::<Vec<_>>()
      .join(" ");
    info!(component, step = index, command = %rendered, "running build step");
    debug!(working_dir = %working_dir.display(), "spawning process");

    let output = command.output().map_err(|source| BuildStepError::Spawn {
      component: component.to_string(),
      index,
      command: rendered.clone(),
      source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stdout.trim().is_empty() {
      debug!(component, step = index, stdout = %stdout.trim_end(), "step stdout");
    }
    if !stderr.trim().is_empty() {
      debug!(component, step = index, stderr = %stderr.trim_end(), "step stderr");
    }

    if !output.status.success() {
      return Err(BuildStepError::Failed {
        component: component.to_string(),
        index,
        command: rendered,
        code: output.status.code(),
      });
    }
    Ok(())
  }
}

impl BuildExecutor for CommandExecutor {
  fn execute(&self, component: &Component, ctx: &BuildContext) -> Result<(), BuildStepError> {
    let prepare = |path: PathBuf| {
      fs::create_dir_all(&path).map_err(|source| BuildStepError::Prepare { path, source })
    };
    prepare(ctx.build_dir().join("tmp"))?;
    prepare(ctx.install_root().to_path_buf())?;

    for (index, step) in component.recipe().iter().enumerate() {
      self.run_step(component.name(), index, step, ctx)?;
    }

    debug!(component = %component.name(), steps = component.recipe().len(), "build finished");
    Ok(())
  }
}
