//! Running a component's build recipe.
//!
//! The recipe is opaque to the orchestrator. It is handed to a
//! [`BuildExecutor`] together with a [`BuildContext`], which exposes the
//! fixed set of values a build may depend on. Executors abort on the first
//! failing step and report its index.

mod command;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::component::Component;
use crate::placeholder::{Placeholder, PlaceholderError, Resolver};

pub use command::CommandExecutor;

#[derive(Debug, Error)]
pub enum BuildStepError {
  /// The step ran and exited unsuccessfully.
  #[error("step {index} (`{command}`) of '{component}' failed with {}", describe_exit(.code))]
  Failed {
    component: String,
    index: usize,
    command: String,
    code: Option<i32>,
  },

  /// The step could not be started.
  #[error("step {index} (`{command}`) of '{component}' could not be started: {source}")]
  Spawn {
    component: String,
    index: usize,
    command: String,
    #[source]
    source: std::io::Error,
  },

  /// A step field references an unknown or malformed placeholder.
  #[error("step {index} of '{component}' has an invalid placeholder: {source}")]
  Placeholder {
    component: String,
    index: usize,
    #[source]
    source: PlaceholderError,
  },

  #[error("failed to prepare build directory '{path}': {source}")]
  Prepare {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl BuildStepError {
  /// Index of the failing step, when the failure belongs to one.
  pub fn step(&self) -> Option<usize> {
    match self {
      BuildStepError::Failed { index, .. }
      | BuildStepError::Spawn { index, .. }
      | BuildStepError::Placeholder { index, .. } => Some(*index),
      BuildStepError::Prepare { .. } => None,
    }
  }
}

fn describe_exit(code: &Option<i32>) -> String {
  match code {
    Some(code) => format!("exit code {}", code),
    None => "no exit code (terminated by signal)".to_string(),
  }
}

/// What a build step may know about its surroundings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
  name: String,
  version: String,
  install_root: PathBuf,
  source_path: PathBuf,
  build_dir: PathBuf,
  install_root_str: String,
  source_path_str: String,
  build_dir_str: String,
}

impl BuildContext {
  pub fn new(name: &str, version: &str, install_root: &Path, source_path: &Path, build_dir: &Path) -> Self {
    Self {
      name: name.to_string(),
      version: version.to_string(),
      install_root: install_root.to_path_buf(),
      source_path: source_path.to_path_buf(),
      build_dir: build_dir.to_path_buf(),
      install_root_str: install_root.to_string_lossy().into_owned(),
      source_path_str: source_path.to_string_lossy().into_owned(),
      build_dir_str: build_dir.to_string_lossy().into_owned(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn install_root(&self) -> &Path {
    &self.install_root
  }

  pub fn source_path(&self) -> &Path {
    &self.source_path
  }

  pub fn build_dir(&self) -> &Path {
    &self.build_dir
  }
}

impl Resolver for BuildContext {
  fn resolve(&self, placeholder: Placeholder) -> &str {
    match placeholder {
      Placeholder::Name => &self.name,
      Placeholder::Version => &self.version,
      Placeholder::InstallDir => &self.install_root_str,
      Placeholder::SourceDir => &self.source_path_str,
      Placeholder::BuildDir => &self.build_dir_str,
    }
  }
}

/// Runs build recipes.
pub trait BuildExecutor: Send + Sync {
  /// Run every step of `component`'s recipe in order, stopping at the first
  /// failure.
  fn execute(&self, component: &Component, ctx: &BuildContext) -> Result<(), BuildStepError>;
}
