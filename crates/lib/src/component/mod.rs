//! Component definitions.
//!
//! A component is one buildable unit of a stack: a name, a version, the names
//! of the components it depends on, where its source comes from, and an
//! opaque build recipe. Components are created by [`evaluate`] and are
//! immutable afterwards, apart from two write-once cells:
//!
//! - the version, when it is bound to another component or to the fetch
//! - the resolved source identity recorded by the fetcher
//!
//! The fingerprint hashes the recipe, the resolved source and the resolved
//! version. It is computed on first use and memoized.

mod types;
mod version;

use std::sync::OnceLock;

use serde::Serialize;
use thiserror::Error;

use crate::util::hash::hash_bytes;

pub use types::*;
pub use version::{Version, VersionError};

#[derive(Debug, Error)]
pub enum DefinitionError {
  #[error("component name must not be empty")]
  EmptyName,

  #[error("invalid component name '{0}': names may not contain whitespace or path separators")]
  InvalidName(String),

  #[error("component '{component}' declares no source (expected url, git, or path)")]
  MissingSource { component: String },

  #[error("component '{component}' declares more than one source kind")]
  AmbiguousSource { component: String },

  #[error("component '{component}' downloads '{url}' without a checksum")]
  MissingChecksum { component: String, url: String },

  #[error("component '{component}' has invalid checksum '{checksum}': expected 64 hex characters")]
  InvalidChecksum { component: String, checksum: String },

  #[error("component '{component}' sets '{field}', which only applies to {applies_to} sources")]
  StrayField {
    component: String,
    field: &'static str,
    applies_to: &'static str,
  },

  #[error("component '{component}' depends on itself")]
  SelfDependency { component: String },

  #[error("component '{component}' takes its version from itself")]
  SelfVersionBinding { component: String },

  #[error("component '{component}' build step {index} has an empty command")]
  EmptyCommand { component: String, index: usize },

  #[error("failed to parse component description: {0}")]
  Parse(#[from] serde_json::Error),
}

/// An evaluated, immutable component.
#[derive(Debug)]
pub struct Component {
  name: String,
  version: Version,
  dependencies: Vec<String>,
  source: SourceDescriptor,
  recipe: Vec<BuildStep>,
  resolution: OnceLock<String>,
  fingerprint: OnceLock<Fingerprint>,
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
  recipe: &'a [BuildStep],
  source: &'a SourceDescriptor,
  resolved: &'a str,
  version: &'a str,
}

impl Component {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn dependencies(&self) -> &[String] {
    &self.dependencies
  }

  pub fn source(&self) -> &SourceDescriptor {
    &self.source
  }

  pub fn recipe(&self) -> &[BuildStep] {
    &self.recipe
  }

  /// Name of the component whose version this one takes, if any.
  pub fn version_binding(&self) -> Option<&str> {
    self.version.binding()
  }

  /// The resolved version.
  ///
  /// Fails with [`VersionError::Unresolved`] while a lazy version has not
  /// been filled.
  pub fn version(&self) -> Result<&str, VersionError> {
    self.version.read(&self.name)
  }

  /// Whether the version is currently readable.
  pub fn is_version_resolved(&self) -> bool {
    self.version.get().is_some()
  }

  /// Fill a version bound to another component with that component's
  /// resolved version.
  pub fn bind_version(&self, value: &str) -> Result<(), VersionError> {
    if !matches!(self.version, Version::From { .. }) {
      return Err(VersionError::Literal {
        component: self.name.clone(),
      });
    }
    self.version.fill(&self.name, value)
  }

  /// Record the identity the fetcher resolved for this component's source.
  ///
  /// Write-once. A component without a declared version takes this value as
  /// its version.
  pub fn record_resolution(&self, identity: &str) -> Result<(), VersionError> {
    let stored = self.resolution.get_or_init(|| identity.to_string());
    if stored != identity {
      return Err(VersionError::AlreadyResolved {
        component: self.name.clone(),
        existing: stored.clone(),
        offered: identity.to_string(),
      });
    }

    if let Version::Fetched { .. } = self.version {
      self.version.fill(&self.name, identity)?;
    }
    Ok(())
  }

  /// The resolved source identity, once recorded.
  pub fn resolution(&self) -> Option<&str> {
    self.resolution.get().map(String::as_str)
  }

  /// Content fingerprint over recipe, resolved source and resolved version.
  ///
  /// Computed once, then cached. Requires the source resolution to be
  /// recorded and the version to be resolved.
  pub fn fingerprint(&self) -> Result<&Fingerprint, VersionError> {
    if let Some(fingerprint) = self.fingerprint.get() {
      return Ok(fingerprint);
    }

    let resolved = self.resolution().ok_or_else(|| VersionError::Unresolved {
      component: self.name.clone(),
      waiting_on: "source resolution".to_string(),
    })?;
    let version = self.version()?;

    let input = FingerprintInput {
      recipe: &self.recipe,
      source: &self.source,
      resolved,
      version,
    };
    // Serializing plain strings, vectors and BTreeMaps cannot fail.
    let serialized = serde_json::to_vec(&input).unwrap_or_default();
    Ok(self.fingerprint.get_or_init(|| Fingerprint(hash_bytes(&serialized).0)))
  }
}

/// Parse and validate a component description.
pub fn evaluate(description: ComponentDescription) -> Result<Component, DefinitionError> {
  let ComponentDescription {
    name,
    version,
    dependencies,
    source,
    build,
  } = description;

  validate_name(&name)?;

  if dependencies.iter().any(|dep| dep == &name) {
    return Err(DefinitionError::SelfDependency { component: name });
  }

  let version = match version {
    Some(VersionDescription::Literal(value)) => Version::Literal(value),
    Some(VersionDescription::From { from }) => {
      if from == name {
        return Err(DefinitionError::SelfVersionBinding { component: name });
      }
      Version::from_component(&from)
    }
    None => Version::fetched(),
  };

  let source = evaluate_source(&name, source)?;

  for (index, step) in build.iter().enumerate() {
    if step.command.trim().is_empty() {
      return Err(DefinitionError::EmptyCommand { component: name, index });
    }
  }

  Ok(Component {
    name,
    version,
    dependencies,
    source,
    recipe: build,
    resolution: OnceLock::new(),
    fingerprint: OnceLock::new(),
  })
}

/// Parse a JSON component description and evaluate it.
pub fn evaluate_json(json: &str) -> Result<Component, DefinitionError> {
  let description: ComponentDescription = serde_json::from_str(json)?;
  evaluate(description)
}

fn validate_name(name: &str) -> Result<(), DefinitionError> {
  if name.is_empty() {
    return Err(DefinitionError::EmptyName);
  }
  if name.chars().any(|c| c.is_whitespace() || c == '/' || c == '\\') || name == "." || name == ".." {
    return Err(DefinitionError::InvalidName(name.to_string()));
  }
  Ok(())
}

fn evaluate_source(component: &str, source: SourceDescription) -> Result<SourceDescriptor, DefinitionError> {
  let SourceDescription {
    url,
    checksum,
    git,
    revision,
    path,
  } = source;

  let kinds = [url.is_some(), git.is_some(), path.is_some()];
  match kinds.iter().filter(|present| **present).count() {
    0 => {
      return Err(DefinitionError::MissingSource {
        component: component.to_string(),
      });
    }
    1 => {}
    _ => {
      return Err(DefinitionError::AmbiguousSource {
        component: component.to_string(),
      });
    }
  }

  let stray = |field: &'static str, applies_to: &'static str| DefinitionError::StrayField {
    component: component.to_string(),
    field,
    applies_to,
  };

  if let Some(url) = url {
    if revision.is_some() {
      return Err(stray("revision", "git"));
    }
    let checksum = checksum.ok_or_else(|| DefinitionError::MissingChecksum {
      component: component.to_string(),
      url: url.clone(),
    })?;
    return Ok(SourceDescriptor::Network {
      url,
      checksum: normalize_checksum(component, &checksum)?,
    });
  }

  if checksum.is_some() {
    return Err(stray("checksum", "url"));
  }

  if let Some(remote) = git {
    return Ok(SourceDescriptor::Vcs {
      remote,
      revision: revision.unwrap_or_else(|| "HEAD".to_string()),
    });
  }

  if revision.is_some() {
    return Err(stray("revision", "git"));
  }

  match path {
    Some(path) => Ok(SourceDescriptor::Local { path }),
    None => Err(DefinitionError::MissingSource {
      component: component.to_string(),
    }),
  }
}

/// Accept `sha256:<hex>` or bare hex, in any case; store lowercase hex.
fn normalize_checksum(component: &str, checksum: &str) -> Result<String, DefinitionError> {
  let hex = checksum.trim();
  let hex = hex.strip_prefix("sha256:").unwrap_or(hex).to_ascii_lowercase();
  if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
    return Err(DefinitionError::InvalidChecksum {
      component: component.to_string(),
      checksum: checksum.to_string(),
    });
  }
  Ok(hex)
}
