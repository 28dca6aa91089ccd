//! Local directory sources, staged into the component's source directory.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::debug;

use super::SourceFetcher;
use super::extract::copy_tree;
use super::types::{FetchContext, FetchError, FetchResult};
use crate::util::hash::hash_directory;

/// Directories ignored when computing the content digest.
const IGNORED: &[&str] = &[".git"];

/// Fetches a `local` source.
///
/// The declared directory is copied to `{source_dir}/{name}` and the build
/// runs against the copy, so build output never lands in the declared
/// directory. Its identity is a digest of the directory contents, so editing
/// a file changes the component's fingerprint.
#[derive(Debug)]
pub struct LocalFetcher {
  component: String,
  path: PathBuf,
  staging: PathBuf,
  retries: u32,
  digest: OnceLock<String>,
}

impl LocalFetcher {
  pub fn new(component: &str, path: &Path, ctx: &FetchContext) -> Self {
    Self {
      component: component.to_string(),
      path: path.to_path_buf(),
      staging: ctx.source_path(component),
      retries: ctx.retries,
      digest: OnceLock::new(),
    }
  }

  fn ensure_exists(&self) -> Result<(), FetchError> {
    if self.path.is_dir() {
      Ok(())
    } else {
      Err(FetchError::PathNotFound(self.path.clone()))
    }
  }

  fn staged_digest(&self) -> Result<String, FetchError> {
    Ok(hash_directory(&self.staging, IGNORED)?.0)
  }
}

impl SourceFetcher for LocalFetcher {
  fn component(&self) -> &str {
    &self.component
  }

  fn retries(&self) -> u32 {
    self.retries
  }

  fn resolve_version(&self) -> Result<String, FetchError> {
    if let Some(digest) = self.digest.get() {
      return Ok(digest.clone());
    }
    self.ensure_exists()?;
    let digest = hash_directory(&self.path, IGNORED)?.0;
    debug!(component = %self.component, path = %self.path.display(), digest = %digest, "hashed local source");
    Ok(self.digest.get_or_init(|| digest).clone())
  }

  fn pin(&self, identity: &str) {
    let _ = self.digest.set(identity.to_string());
  }

  fn fetch_required(&self) -> Result<bool, FetchError> {
    if !self.staging.is_dir() {
      return Ok(true);
    }
    Ok(self.staged_digest()? != self.resolve_version()?)
  }

  /// Restage the declared directory. The returned version is the digest of
  /// the staged copy, which is what the build sees.
  fn attempt(&self) -> Result<FetchResult, FetchError> {
    self.ensure_exists()?;
    copy_tree(&self.path, &self.staging, IGNORED)?;
    Ok(FetchResult {
      version: self.staged_digest()?,
      path: self.staging.clone(),
      verified: false,
    })
  }

  fn verify_checksum(&self) -> Result<(), FetchError> {
    self.ensure_exists()?;
    if !self.staging.is_dir() {
      return Err(FetchError::NotFetched {
        component: self.component.clone(),
      });
    }
    let expected = self.resolve_version()?;
    let actual = self.staged_digest()?;
    if actual != expected {
      return Err(FetchError::ChecksumMismatch {
        component: self.component.clone(),
        expected,
        actual,
      });
    }
    Ok(())
  }
}
