//! Orchestrator configuration.
//!
//! Directory roots and tuning knobs are resolved the same way store paths
//! are: an explicit `STACKWRIGHT_*` environment variable wins, otherwise the
//! platform cache/data directory is used.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::DEFAULT_FETCH_RETRIES;
use crate::platform::paths::{cache_dir, data_dir};

pub const ENV_SOURCE_DIR: &str = "STACKWRIGHT_SOURCE_DIR";
pub const ENV_CACHE_DIR: &str = "STACKWRIGHT_CACHE_DIR";
pub const ENV_BUILD_DIR: &str = "STACKWRIGHT_BUILD_DIR";
pub const ENV_SNAPSHOT_DIR: &str = "STACKWRIGHT_SNAPSHOT_DIR";
pub const ENV_FETCH_RETRIES: &str = "STACKWRIGHT_FETCH_RETRIES";
pub const ENV_WORKERS: &str = "STACKWRIGHT_WORKERS";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid value '{value}' for {var}: expected a non-negative integer")]
  InvalidNumber { var: &'static str, value: String },
}

/// Directory roots and tuning knobs read by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
  /// Root under which each component's source is unpacked (`{source_dir}/{name}`).
  pub source_dir: PathBuf,

  /// Root for downloaded artifacts and git mirrors.
  pub cache_dir: PathBuf,

  /// Root for per-component scratch build directories.
  pub build_dir: PathBuf,

  /// Base directory of the install-root snapshot stores.
  pub snapshot_dir: PathBuf,

  /// Extra attempts after a transient fetch failure.
  pub fetch_retries: u32,

  /// Worker count for pool fan-out (hashing, prefetch).
  pub workers: usize,
}

impl BuildConfig {
  /// Resolve the configuration from the environment.
  pub fn from_env() -> Result<Self, ConfigError> {
    let cache_root = cache_dir();
    let data_root = data_dir();

    Ok(Self {
      source_dir: env_path(ENV_SOURCE_DIR).unwrap_or_else(|| cache_root.join("src")),
      cache_dir: env_path(ENV_CACHE_DIR).unwrap_or_else(|| cache_root.join("cache")),
      build_dir: env_path(ENV_BUILD_DIR).unwrap_or_else(|| cache_root.join("build")),
      snapshot_dir: env_path(ENV_SNAPSHOT_DIR).unwrap_or_else(|| data_root.join("snapshots")),
      fetch_retries: env_number(ENV_FETCH_RETRIES)?.unwrap_or(DEFAULT_FETCH_RETRIES),
      workers: env_number(ENV_WORKERS)?.unwrap_or_else(default_workers),
    })
  }

  /// A self-contained configuration with every directory under `root`.
  pub fn rooted_at(root: &Path) -> Self {
    Self {
      source_dir: root.join("src"),
      cache_dir: root.join("cache"),
      build_dir: root.join("build"),
      snapshot_dir: root.join("snapshots"),
      fetch_retries: DEFAULT_FETCH_RETRIES,
      workers: default_workers(),
    }
  }

  pub fn with_fetch_retries(mut self, retries: u32) -> Self {
    self.fetch_retries = retries;
    self
  }

  pub fn with_workers(mut self, workers: usize) -> Self {
    self.workers = workers;
    self
  }
}

fn env_path(var: &str) -> Option<PathBuf> {
  std::env::var(var).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

fn env_number<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
  match std::env::var(var) {
    Ok(value) if !value.trim().is_empty() => value
      .trim()
      .parse()
      .map(Some)
      .map_err(|_| ConfigError::InvalidNumber { var, value }),
    _ => Ok(None),
  }
}

fn default_workers() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
