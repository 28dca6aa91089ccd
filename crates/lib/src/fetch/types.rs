//! Types shared by all source fetchers.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::BuildConfig;
use crate::util::hash::HashError;

/// Timeout for a single HTTP transfer.
const HTTP_TIMEOUT: Duration = Duration::from_secs(600);

/// Timeout for establishing an HTTP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur while acquiring source.
///
/// Connection-level failures are transient and retried by
/// [`with_retries`](super::with_retries); everything else fails immediately.
/// A checksum mismatch in particular is never retried.
#[derive(Debug, Error)]
pub enum FetchError {
  /// The connection failed, timed out, or broke mid-transfer.
  #[error("connection to '{url}' failed: {message}")]
  Connection { url: String, message: String },

  /// The request could not be built or was rejected before transfer.
  #[error("request for '{url}' failed: {message}")]
  Request { url: String, message: String },

  /// The server answered with a non-success status.
  #[error("HTTP {status} from '{url}'")]
  HttpStatus { url: String, status: u16 },

  /// The acquired artifact does not match the declared digest.
  #[error("checksum mismatch for '{component}': expected {expected}, got {actual}")]
  ChecksumMismatch {
    component: String,
    expected: String,
    actual: String,
  },

  /// Cloning, connecting to, or fetching from a remote failed.
  #[error("failed to reach remote '{remote}': {source}")]
  GitTransport {
    remote: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  /// A local repository operation failed.
  #[error("git operation on '{remote}' failed: {message}")]
  Git { remote: String, message: String },

  /// The declared revision does not exist in the repository.
  #[error("revision '{revision}' not found in '{remote}'")]
  RevisionNotFound { remote: String, revision: String },

  /// Unpacking a downloaded archive failed.
  #[error("failed to extract '{archive}': {message}")]
  Extract { archive: PathBuf, message: String },

  /// A local source path does not exist.
  #[error("source path does not exist: {0}")]
  PathNotFound(PathBuf),

  /// Verification was requested before anything was acquired.
  #[error("source of '{component}' has not been fetched")]
  NotFetched { component: String },

  #[error("i/o error at '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error("failed to create HTTP client: {0}")]
  Client(#[source] reqwest::Error),

  /// A transient failure persisted through every allowed attempt.
  #[error("fetching '{component}' failed after {attempts} attempts: {last}")]
  RetriesExhausted {
    component: String,
    attempts: u32,
    #[source]
    last: Box<FetchError>,
  },
}

impl FetchError {
  /// Whether retrying the same operation may succeed.
  pub fn is_transient(&self) -> bool {
    match self {
      FetchError::Connection { .. } | FetchError::GitTransport { .. } => true,
      FetchError::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,
      _ => false,
    }
  }

  /// Whether this is an integrity failure (tampering or a stale descriptor).
  pub fn is_integrity(&self) -> bool {
    matches!(self, FetchError::ChecksumMismatch { .. })
  }

  pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> FetchError {
    let path = path.into();
    move |source| FetchError::Io { path, source }
  }

  /// Classify a transport error from the HTTP client.
  pub(crate) fn from_reqwest(url: &str, error: reqwest::Error) -> FetchError {
    if let Some(status) = error.status() {
      return FetchError::HttpStatus {
        url: url.to_string(),
        status: status.as_u16(),
      };
    }

    if error.is_connect() || error.is_timeout() || error.is_body() || error.is_request() || error.is_decode() {
      FetchError::Connection {
        url: url.to_string(),
        message: error.to_string(),
      }
    } else {
      FetchError::Request {
        url: url.to_string(),
        message: error.to_string(),
      }
    }
  }
}

/// Outcome of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
  /// The resolved source identity (checksum, commit id, or directory digest).
  pub version: String,
  /// Where the acquired source lives.
  pub path: PathBuf,
  /// Whether the acquired content was checked against the descriptor.
  pub verified: bool,
}

/// Directories and transport shared by the fetchers of one run.
#[derive(Debug, Clone)]
pub struct FetchContext {
  /// Root of the per-component source directories.
  pub source_dir: PathBuf,
  /// Root of downloads and git mirrors.
  pub cache_dir: PathBuf,
  /// Extra attempts after a transient failure.
  pub retries: u32,
  /// Shared blocking HTTP client.
  pub client: reqwest::blocking::Client,
}

impl FetchContext {
  pub fn from_config(config: &BuildConfig) -> Result<Self, FetchError> {
    let client = reqwest::blocking::Client::builder()
      .timeout(HTTP_TIMEOUT)
      .connect_timeout(CONNECT_TIMEOUT)
      .user_agent(concat!("stackwright/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(FetchError::Client)?;

    Ok(Self {
      source_dir: config.source_dir.clone(),
      cache_dir: config.cache_dir.clone(),
      retries: config.fetch_retries,
      client,
    })
  }

  /// Source directory of one component.
  pub fn source_path(&self, component: &str) -> PathBuf {
    self.source_dir.join(component)
  }

  /// Download directory of one component.
  pub fn download_dir(&self, component: &str) -> PathBuf {
    self.cache_dir.join("downloads").join(component)
  }

  /// Git mirror of one component.
  pub fn mirror_path(&self, component: &str) -> PathBuf {
    self.cache_dir.join("git").join(component)
  }
}
