//! Source acquisition.
//!
//! Every component source kind has a fetcher implementing [`SourceFetcher`]:
//!
//! - [`NetworkFetcher`]: downloads an archive, verifies its SHA-256 and unpacks it
//! - [`GitFetcher`]: mirrors a repository and checks out the declared revision
//! - [`LocalFetcher`]: stages a copy of a local directory
//!
//! Fetchers only write below their component's namespaced source and cache
//! directories; they never touch the install root.
//!
//! # Cache Structure
//!
//! ```text
//! {cache_dir}/downloads/{name}/{file}         # downloaded archive
//! {cache_dir}/downloads/{name}/{file}.stamp   # freshness stamp
//! {cache_dir}/git/{name}/                     # git mirror
//! {cache_dir}/git/{name}.checkout             # commit exported to the source dir
//! {source_dir}/{name}/                        # unpacked, checked out or staged source
//! ```

mod extract;
mod git;
mod local;
mod network;
mod types;

use tracing::{debug, warn};

use crate::component::{Component, SourceDescriptor};

pub use extract::{copy_tree, extract_archive, source_root};
pub use git::GitFetcher;
pub use local::LocalFetcher;
pub use network::NetworkFetcher;
pub use types::{FetchContext, FetchError, FetchResult};

/// Common contract of all source fetchers.
pub trait SourceFetcher: Send + Sync {
  /// Name of the component this fetcher acquires.
  fn component(&self) -> &str;

  /// Extra attempts allowed after a transient failure.
  fn retries(&self) -> u32;

  /// Resolve the identity of the declared source: the archive checksum, the
  /// commit the revision points at, or a digest of a local directory.
  fn resolve_version(&self) -> Result<String, FetchError>;

  /// Fix the identity [`resolve_version`](Self::resolve_version) returns to
  /// one resolved earlier, so acquisition targets exactly that identity.
  ///
  /// Network sources ignore this; their identity is the declared checksum.
  fn pin(&self, _identity: &str) {}

  /// Whether the local copy is missing or does not match the descriptor.
  fn fetch_required(&self) -> Result<bool, FetchError>;

  /// One acquisition attempt, without retries.
  fn attempt(&self) -> Result<FetchResult, FetchError>;

  /// Recompute the digest of the acquired artifact and compare it with the
  /// declared one.
  fn verify_checksum(&self) -> Result<(), FetchError>;

  /// Acquire the source, retrying transient failures.
  fn fetch(&self) -> Result<FetchResult, FetchError> {
    with_retries(self.component(), self.retries(), || self.attempt())
  }
}

/// Run `operation`, retrying transient failures up to `retries` extra times.
///
/// Attempts follow each other immediately. Non-transient errors (including
/// checksum mismatches) are returned as-is on first occurrence; a transient
/// error that survives every attempt is wrapped in
/// [`FetchError::RetriesExhausted`].
pub fn with_retries<T>(
  component: &str,
  retries: u32,
  mut operation: impl FnMut() -> Result<T, FetchError>,
) -> Result<T, FetchError> {
  let attempts = retries.saturating_add(1);
  let mut attempt = 0;

  loop {
    attempt += 1;
    match operation() {
      Ok(value) => {
        if attempt > 1 {
          debug!(component, attempt, "fetch succeeded after retry");
        }
        return Ok(value);
      }
      Err(e) if e.is_transient() && attempt < attempts => {
        warn!(component, attempt, error = %e, "transient fetch failure, retrying");
      }
      Err(e) if e.is_transient() => {
        return Err(FetchError::RetriesExhausted {
          component: component.to_string(),
          attempts: attempt,
          last: Box::new(e),
        });
      }
      Err(e) => return Err(e),
    }
  }
}

/// Select the fetcher for a component's source kind.
///
/// A source identity already recorded on the component is pinned, so the
/// fetcher acquires the content the component's fingerprint covers.
pub fn fetcher_for(component: &Component, ctx: &FetchContext) -> Box<dyn SourceFetcher> {
  let fetcher: Box<dyn SourceFetcher> = match component.source() {
    SourceDescriptor::Network { url, checksum } => Box::new(NetworkFetcher::new(component.name(), url, checksum, ctx)),
    SourceDescriptor::Vcs { remote, revision } => Box::new(GitFetcher::new(component.name(), remote, revision, ctx)),
    SourceDescriptor::Local { path } => Box::new(LocalFetcher::new(component.name(), path, ctx)),
  };
  if let Some(identity) = component.resolution() {
    fetcher.pin(identity);
  }
  fetcher
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::Cell;
  use tracing_test::traced_test;

  fn unavailable() -> FetchError {
    FetchError::HttpStatus {
      url: "https://mirror.example.com/zlib.tar.gz".to_string(),
      status: 503,
    }
  }

  /// Fails transiently `failures` times, then succeeds.
  fn flaky(failures: u32) -> (Cell<u32>, impl Fn(&Cell<u32>) -> Result<&'static str, FetchError>) {
    let calls = Cell::new(0);
    let op = move |calls: &Cell<u32>| {
      calls.set(calls.get() + 1);
      if calls.get() <= failures {
        Err(unavailable())
      } else {
        Ok("fetched")
      }
    };
    (calls, op)
  }

  #[test]
  fn succeeds_when_failures_equal_budget() {
    let (calls, op) = flaky(3);
    let result = with_retries("zlib", 3, || op(&calls));
    assert_eq!(result.unwrap(), "fetched");
    assert_eq!(calls.get(), 4);
  }

  #[test]
  fn fails_when_failures_exceed_budget() {
    let (calls, op) = flaky(4);
    let err = with_retries("zlib", 3, || op(&calls)).unwrap_err();
    assert!(matches!(
      err,
      FetchError::RetriesExhausted {
        attempts: 4,
        ..
      }
    ));
    assert_eq!(calls.get(), 4);
  }

  #[test]
  fn zero_budget_means_single_attempt() {
    let (calls, op) = flaky(1);
    assert!(with_retries("zlib", 0, || op(&calls)).is_err());
    assert_eq!(calls.get(), 1);
  }

  #[test]
  fn checksum_mismatch_is_not_retried() {
    let calls = Cell::new(0);
    let err = with_retries("zlib", 5, || -> Result<(), FetchError> {
      calls.set(calls.get() + 1);
      Err(FetchError::ChecksumMismatch {
        component: "zlib".to_string(),
        expected: "aa".to_string(),
        actual: "bb".to_string(),
      })
    })
    .unwrap_err();

    assert!(err.is_integrity());
    assert_eq!(calls.get(), 1);
  }

  #[test]
  fn client_errors_are_not_retried() {
    let calls = Cell::new(0);
    let err = with_retries("zlib", 5, || -> Result<(), FetchError> {
      calls.set(calls.get() + 1);
      Err(FetchError::HttpStatus {
        url: "https://example.com/missing.tgz".to_string(),
        status: 404,
      })
    })
    .unwrap_err();

    assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    assert_eq!(calls.get(), 1);
  }

  #[test]
  #[traced_test]
  fn retried_failures_are_logged() {
    let (calls, op) = flaky(1);
    with_retries("zlib", 2, || op(&calls)).unwrap();
    assert!(logs_contain("transient fetch failure, retrying"));
    assert!(logs_contain("fetch succeeded after retry"));
  }
}
