use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Structured description of one component, as read from a project file.
///
/// This is plain data. `evaluate` validates it and turns it into an
/// immutable [`Component`](super::Component).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentDescription {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<VersionDescription>,
  #[serde(default)]
  pub dependencies: Vec<String>,
  pub source: SourceDescription,
  #[serde(default)]
  pub build: Vec<BuildStep>,
}

/// A version literal, or a binding to another component's resolved version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VersionDescription {
  Literal(String),
  From { from: String },
}

/// Source fields as written by users; exactly one kind must be present.
///
/// - `{ "url": ..., "checksum": ... }` downloads an archive
/// - `{ "git": ..., "revision": ... }` checks out a repository
/// - `{ "path": ... }` uses a local directory as-is
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceDescription {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub checksum: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub git: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub revision: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<PathBuf>,
}

/// Validated source descriptor.
///
/// The serialized form is part of the component fingerprint, so field order
/// and names are load-bearing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceDescriptor {
  /// An archive downloaded over the network and verified by SHA-256.
  Network { url: String, checksum: String },
  /// A version-control checkout of `revision` from `remote`.
  Vcs { remote: String, revision: String },
  /// A local directory, staged into the source directory for builds.
  Local { path: PathBuf },
}

impl SourceDescriptor {
  pub fn kind(&self) -> &'static str {
    match self {
      SourceDescriptor::Network { .. } => "network",
      SourceDescriptor::Vcs { .. } => "vcs",
      SourceDescriptor::Local { .. } => "local",
    }
  }

  /// Human readable location (url, remote, or path).
  pub fn locator(&self) -> String {
    match self {
      SourceDescriptor::Network { url, .. } => url.clone(),
      SourceDescriptor::Vcs { remote, revision } => format!("{}#{}", remote, revision),
      SourceDescriptor::Local { path } => path.display().to_string(),
    }
  }
}

/// One opaque step of a build recipe.
///
/// The core never interprets steps; they are handed to a
/// [`BuildExecutor`](crate::build::BuildExecutor) in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildStep {
  pub command: String,
  #[serde(default)]
  pub args: Vec<String>,
  #[serde(default)]
  pub options: StepOptions,
}

impl BuildStep {
  pub fn new(command: &str) -> Self {
    Self {
      command: command.to_string(),
      args: Vec::new(),
      options: StepOptions::default(),
    }
  }

  pub fn with_args<I, S>(mut self, args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.args = args.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_env(mut self, key: &str, value: &str) -> Self {
    self.options.env.insert(key.to_string(), value.to_string());
    self
  }

  pub fn with_cwd(mut self, cwd: &str) -> Self {
    self.options.cwd = Some(cwd.to_string());
    self
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepOptions {
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cwd: Option<String>,
}

/// Content hash of a component's recipe, resolved source and version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}
