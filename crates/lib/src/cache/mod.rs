//! Incremental build cache over the shared install root.
//!
//! Every component build is staged against whatever the components before it
//! left in the install root. A component's cache key therefore chains the
//! fingerprints of all components that precede it in build order with its
//! own fingerprint: touching anything upstream moves every downstream key.
//!
//! The cache restores and captures whole install root states through an
//! injected [`SnapshotStore`]. It is not synchronized; the caller runs
//! [`IncrementalCache::restore`] and [`IncrementalCache::capture`] once per
//! component, in build order, never concurrently.

pub mod store;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::component::{Component, VersionError};
use crate::consts::CACHE_SERIAL;

pub use store::{CacheStoreError, Commit, DirSnapshotStore, SnapshotStore};

/// Entries that make a directory look like a bare git repository.
const BARE_REPOSITORY_MARKERS: &[&str] = &["config", "HEAD", "description", "hooks", "info", "objects", "refs"];

#[derive(Debug, Error)]
pub enum CacheError {
  /// A fingerprint in the chain is not computable yet.
  #[error(transparent)]
  Key(#[from] VersionError),

  #[error(transparent)]
  Store(#[from] CacheStoreError),

  #[error("failed to strip version control metadata at '{path}': {source}")]
  Strip {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to reset install root '{path}': {source}")]
  Reset {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Chained fingerprint of a component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Outcome of [`IncrementalCache::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
  /// The install root now holds the component's cached state.
  Hit,
  /// Nothing cached; the install root was left untouched.
  Miss,
}

/// Restore/capture protocol for one install root.
#[derive(Debug)]
pub struct IncrementalCache<S> {
  store: S,
  install_root: PathBuf,
}

impl<S: SnapshotStore> IncrementalCache<S> {
  pub fn new(store: S, install_root: &Path) -> Self {
    Self {
      store,
      install_root: install_root.to_path_buf(),
    }
  }

  pub fn store(&self) -> &S {
    &self.store
  }

  pub fn install_root(&self) -> &Path {
    &self.install_root
  }

  /// SHA-256 over the fingerprints of `preceding` in order, then the
  /// component's own fingerprint.
  pub fn key_for(component: &Component, preceding: &[Arc<Component>]) -> Result<CacheKey, CacheError> {
    let mut hasher = Sha256::new();
    for earlier in preceding {
      hasher.update(earlier.fingerprint()?.0.as_bytes());
    }
    hasher.update(component.fingerprint()?.0.as_bytes());
    Ok(CacheKey(hex::encode(hasher.finalize())))
  }

  /// Snapshot tag of a component under a key.
  pub fn tag_for(component: &Component, key: &CacheKey) -> String {
    format!("{}-{}-{}", component.name(), key, CACHE_SERIAL)
  }

  /// Materialize the cached state of `component`, if there is one.
  pub fn restore(&mut self, component: &Component, preceding: &[Arc<Component>]) -> Result<CacheStatus, CacheError> {
    let key = Self::key_for(component, preceding)?;
    let tag = Self::tag_for(component, &key);

    if !self.store.exists(&tag)? {
      debug!(component = %component.name(), %tag, "cache miss");
      return Ok(CacheStatus::Miss);
    }

    self.store.get(&tag)?;
    info!(component = %component.name(), %tag, "restored from cache");
    Ok(CacheStatus::Hit)
  }

  /// Empty the install root so the first component of a run builds on a
  /// clean tree.
  pub fn reset(&mut self) -> Result<(), CacheError> {
    let reset_err = |path: &Path| {
      let path = path.to_path_buf();
      move |source| CacheError::Reset { path, source }
    };

    if self.install_root.exists() {
      for entry in fs::read_dir(&self.install_root).map_err(reset_err(&self.install_root))? {
        let entry = entry.map_err(reset_err(&self.install_root))?;
        let path = entry.path();
        let removed = if entry.file_type().map_err(reset_err(&path))?.is_dir() {
          fs::remove_dir_all(&path)
        } else {
          fs::remove_file(&path)
        };
        removed.map_err(reset_err(&path))?;
      }
    }

    fs::create_dir_all(&self.install_root).map_err(reset_err(&self.install_root))?;
    debug!(install_root = %self.install_root.display(), "reset install root");
    Ok(())
  }

  /// Commit the install root as the state after building `component`.
  pub fn capture(&mut self, component: &Component, preceding: &[Arc<Component>]) -> Result<Commit, CacheError> {
    let key = Self::key_for(component, preceding)?;
    let tag = Self::tag_for(component, &key);

    let stripped = strip_vcs_metadata(&self.install_root)?;
    if stripped > 0 {
      debug!(component = %component.name(), stripped, "removed version control metadata");
    }

    let commit = self.store.put(&tag)?;
    debug!(component = %component.name(), %tag, ?commit, "captured install root");
    Ok(commit)
  }
}

/// Remove `.git` directories and bare-repository-shaped directories below
/// `root`. Returns how many were removed; a second call returns 0.
pub fn strip_vcs_metadata(root: &Path) -> Result<usize, CacheError> {
  if !root.is_dir() {
    return Ok(0);
  }

  let mut doomed = Vec::new();
  let mut walker = WalkDir::new(root).min_depth(1).into_iter();
  while let Some(entry) = walker.next() {
    let entry = entry.map_err(|e| CacheError::Strip {
      path: root.to_path_buf(),
      source: e.into(),
    })?;
    if !entry.file_type().is_dir() {
      continue;
    }

    if entry.file_name() == ".git" || is_bare_repository(entry.path()) {
      doomed.push(entry.path().to_path_buf());
      walker.skip_current_dir();
    }
  }

  for path in &doomed {
    fs::remove_dir_all(path).map_err(|source| CacheError::Strip {
      path: path.clone(),
      source,
    })?;
  }
  Ok(doomed.len())
}

fn is_bare_repository(dir: &Path) -> bool {
  BARE_REPOSITORY_MARKERS.iter().all(|marker| dir.join(marker).exists())
}
