//! Version manifest of a built install root.
//!
//! After a successful run the orchestrator records, for every component, the
//! version that was built, where its source came from, and its fingerprint.
//! Packagers read this file to describe what a stack contains.
//!
//! # Example
//!
//! ```json
//! {
//!   "manifest_format": 1,
//!   "project": "demo-stack",
//!   "build_version": "1.2.0",
//!   "software": {
//!     "zlib": {
//!       "version": "1.3.1",
//!       "source": { "kind": "network", "locator": "https://zlib.net/zlib-1.3.1.tar.gz" },
//!       "fingerprint": "3f2a..."
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::component::{Component, VersionError};
use crate::consts::VERSION_MANIFEST_FILENAME;

/// Current manifest format.
pub const MANIFEST_FORMAT: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error(transparent)]
  Version(#[from] VersionError),

  #[error("failed to serialize version manifest: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("failed to parse version manifest '{path}': {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("unsupported version manifest format {0}")]
  UnsupportedFormat(u32),

  #[error("i/o error at '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSource {
  pub kind: String,
  pub locator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
  pub version: String,
  pub source: ManifestSource,
  pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionManifest {
  pub manifest_format: u32,
  pub project: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub build_version: Option<String>,
  pub software: BTreeMap<String, ManifestEntry>,
}

impl VersionManifest {
  /// Describe `components`, each of which must have a computable fingerprint.
  pub fn from_components(
    project: &str,
    build_version: Option<&str>,
    components: &[Arc<Component>],
  ) -> Result<Self, ManifestError> {
    let mut software = BTreeMap::new();
    for component in components {
      software.insert(
        component.name().to_string(),
        ManifestEntry {
          version: component.version()?.to_string(),
          source: ManifestSource {
            kind: component.source().kind().to_string(),
            locator: component.source().locator(),
          },
          fingerprint: component.fingerprint()?.0.clone(),
        },
      );
    }

    Ok(Self {
      manifest_format: MANIFEST_FORMAT,
      project: project.to_string(),
      build_version: build_version.map(str::to_string),
      software,
    })
  }

  /// Path of the manifest inside an install root.
  pub fn path_in(install_root: &Path) -> PathBuf {
    install_root.join(VERSION_MANIFEST_FILENAME)
  }

  /// Write the manifest into `install_root` atomically.
  pub fn write(&self, install_root: &Path) -> Result<PathBuf, ManifestError> {
    fs::create_dir_all(install_root).map_err(|source| ManifestError::Io {
      path: install_root.to_path_buf(),
      source,
    })?;

    let path = Self::path_in(install_root);
    let temp = install_root.join(format!("{}.tmp", VERSION_MANIFEST_FILENAME));
    let content = serde_json::to_string_pretty(self).map_err(ManifestError::Serialize)?;

    fs::write(&temp, content).map_err(|source| ManifestError::Io {
      path: temp.clone(),
      source,
    })?;
    fs::rename(&temp, &path).map_err(|source| ManifestError::Io {
      path: path.clone(),
      source,
    })?;
    Ok(path)
  }

  /// Read the manifest of `install_root`, if one was written.
  pub fn load(install_root: &Path) -> Result<Option<Self>, ManifestError> {
    let path = Self::path_in(install_root);
    let content = match fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => return Err(ManifestError::Io { path, source }),
    };

    let manifest: Self = serde_json::from_str(&content).map_err(|source| ManifestError::Parse {
      path: path.clone(),
      source,
    })?;
    if manifest.manifest_format != MANIFEST_FORMAT {
      return Err(ManifestError::UnsupportedFormat(manifest.manifest_format));
    }
    Ok(Some(manifest))
  }
}
