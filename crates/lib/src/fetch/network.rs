//! Archive downloads with SHA-256 verification.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::extract::{extract_archive, source_root};
use super::types::{FetchContext, FetchError, FetchResult};
use super::SourceFetcher;
use crate::consts::FETCH_STAMP_SUFFIX;
use crate::util::hash::{fast_file_digest, hash_bytes, hash_file};

/// Freshness record written next to a verified download.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct Stamp {
  /// The declared SHA-256 the download was verified against.
  checksum: String,
  /// XXH3 digest of the file at verification time.
  digest: String,
}

/// Fetches a `network` source.
#[derive(Debug)]
pub struct NetworkFetcher {
  component: String,
  url: String,
  checksum: String,
  archive: PathBuf,
  source: PathBuf,
  retries: u32,
  client: reqwest::blocking::Client,
}

impl NetworkFetcher {
  pub fn new(component: &str, url: &str, checksum: &str, ctx: &FetchContext) -> Self {
    Self {
      component: component.to_string(),
      url: url.to_string(),
      checksum: checksum.to_string(),
      archive: ctx.download_dir(component).join(url_to_filename(url)),
      source: ctx.source_path(component),
      retries: ctx.retries,
      client: ctx.client.clone(),
    }
  }

  /// Where the downloaded artifact is kept.
  pub fn archive_path(&self) -> &Path {
    &self.archive
  }

  fn stamp_path(&self) -> PathBuf {
    let mut name = self.archive.as_os_str().to_owned();
    name.push(FETCH_STAMP_SUFFIX);
    PathBuf::from(name)
  }

  fn read_stamp(&self) -> Option<Stamp> {
    let content = fs::read_to_string(self.stamp_path()).ok()?;
    serde_json::from_str(&content).ok()
  }

  fn write_stamp(&self) -> Result<(), FetchError> {
    let stamp = Stamp {
      checksum: self.checksum.clone(),
      digest: fast_file_digest(&self.archive)?,
    };
    let path = self.stamp_path();
    // Stamp serialization only involves strings.
    let content = serde_json::to_string(&stamp).unwrap_or_default();
    fs::write(&path, content).map_err(FetchError::io(&path))
  }

  /// Stream the artifact into a `.part` file, then move it into place.
  fn download(&self) -> Result<(), FetchError> {
    let dir = self.archive.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).map_err(FetchError::io(dir))?;

    info!(component = %self.component, url = %self.url, "downloading");

    let mut response = self
      .client
      .get(&self.url)
      .send()
      .map_err(|e| FetchError::from_reqwest(&self.url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(FetchError::HttpStatus {
        url: self.url.clone(),
        status: status.as_u16(),
      });
    }

    let mut partial = self.archive.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let mut file = File::create(&partial).map_err(FetchError::io(&partial))?;
    let size = match response.copy_to(&mut file) {
      Ok(size) => size,
      Err(e) => {
        let _ = fs::remove_file(&partial);
        return Err(FetchError::from_reqwest(&self.url, e));
      }
    };
    drop(file);

    fs::rename(&partial, &self.archive).map_err(FetchError::io(&self.archive))?;
    debug!(component = %self.component, path = %self.archive.display(), size, "download complete");
    Ok(())
  }
}

impl SourceFetcher for NetworkFetcher {
  fn component(&self) -> &str {
    &self.component
  }

  fn retries(&self) -> u32 {
    self.retries
  }

  /// The declared checksum identifies the artifact.
  fn resolve_version(&self) -> Result<String, FetchError> {
    Ok(self.checksum.clone())
  }

  fn fetch_required(&self) -> Result<bool, FetchError> {
    if !self.archive.exists() {
      return Ok(true);
    }

    let Some(stamp) = self.read_stamp() else {
      return Ok(true);
    };
    if stamp.checksum != self.checksum {
      debug!(component = %self.component, "declared checksum changed since last download");
      return Ok(true);
    }

    let current = fast_file_digest(&self.archive)?;
    Ok(current != stamp.digest)
  }

  fn attempt(&self) -> Result<FetchResult, FetchError> {
    if self.fetch_required()? {
      self.download()?;
      if let Err(e) = self.verify_checksum() {
        let _ = fs::remove_file(&self.archive);
        let _ = fs::remove_file(self.stamp_path());
        return Err(e);
      }
      self.write_stamp()?;
    } else {
      debug!(component = %self.component, path = %self.archive.display(), "using cached download");
    }

    extract_archive(&self.archive, &self.source)?;

    Ok(FetchResult {
      version: self.checksum.clone(),
      path: source_root(&self.source)?,
      verified: true,
    })
  }

  fn verify_checksum(&self) -> Result<(), FetchError> {
    if !self.archive.exists() {
      return Err(FetchError::NotFetched {
        component: self.component.clone(),
      });
    }

    let actual = hash_file(&self.archive)?.0;
    if !actual.eq_ignore_ascii_case(&self.checksum) {
      return Err(FetchError::ChecksumMismatch {
        component: self.component.clone(),
        expected: self.checksum.clone(),
        actual,
      });
    }
    Ok(())
  }
}

/// Convert a URL to a safe filename.
///
/// Takes the last path component without its query string and replaces
/// anything outside `[A-Za-z0-9._-]`. Falls back to a digest of the URL.
fn url_to_filename(url: &str) -> String {
  let last = url.rsplit('/').next().unwrap_or_default();
  let last = last.split(['?', '#']).next().unwrap_or(last);

  let sanitized: String = last
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
        c
      } else {
        '_'
      }
    })
    .collect();

  if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
    return sanitized;
  }

  format!("download_{}", &hash_bytes(url.as_bytes()).0[..16])
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::BuildConfig;
  use crate::fetch::with_retries;

  use flate2::Compression;
  use flate2::write::GzEncoder;
  use mockito::Server;
  use tempfile::TempDir;

  fn tarball() -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let content = b"#define ZLIB_VERSION \"1.3.1\"\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
      .append_data(&mut header, "zlib-1.3.1/zlib.h", &content[..])
      .unwrap();
    builder.into_inner().unwrap().finish().unwrap()
  }

  fn sha256(data: &[u8]) -> String {
    hash_bytes(data).0
  }

  fn context(temp: &TempDir, retries: u32) -> FetchContext {
    let config = BuildConfig::rooted_at(temp.path()).with_fetch_retries(retries);
    FetchContext::from_config(&config).unwrap()
  }

  mod url_to_filename {
    use super::*;

    #[test]
    fn takes_last_segment() {
      assert_eq!(url_to_filename("https://zlib.net/zlib-1.3.1.tar.gz"), "zlib-1.3.1.tar.gz");
    }

    #[test]
    fn drops_query_string() {
      assert_eq!(
        url_to_filename("https://example.com/file.tar.gz?token=abc"),
        "file.tar.gz"
      );
    }

    #[test]
    fn sanitizes_special_chars() {
      assert_eq!(
        url_to_filename("https://example.com/file name.tar.gz"),
        "file_name.tar.gz"
      );
    }

    #[test]
    fn falls_back_to_digest() {
      assert!(url_to_filename("https://example.com/").starts_with("download_"));
    }
  }

  #[test]
  fn fetch_downloads_verifies_and_extracts() {
    let body = tarball();
    let mut server = Server::new();
    let mock = server
      .mock("GET", "/zlib-1.3.1.tar.gz")
      .with_status(200)
      .with_body(&body)
      .expect(1)
      .create();

    let temp = TempDir::new().unwrap();
    let ctx = context(&temp, 0);
    let url = format!("{}/zlib-1.3.1.tar.gz", server.url());
    let fetcher = NetworkFetcher::new("zlib", &url, &sha256(&body), &ctx);

    assert!(fetcher.fetch_required().unwrap());
    let result = fetcher.fetch().unwrap();
    mock.assert();

    assert!(result.verified);
    assert_eq!(result.version, sha256(&body));
    assert_eq!(result.path, ctx.source_path("zlib").join("zlib-1.3.1"));
    assert!(result.path.join("zlib.h").exists());
    assert!(fetcher.verify_checksum().is_ok());
  }

  #[test]
  fn freshness_follows_declared_checksum() {
    let body = tarball();
    let mut server = Server::new();
    let mock = server
      .mock("GET", "/zlib.tar.gz")
      .with_body(&body)
      .expect(1)
      .create();

    let temp = TempDir::new().unwrap();
    let ctx = context(&temp, 0);
    let url = format!("{}/zlib.tar.gz", server.url());

    let fetcher = NetworkFetcher::new("zlib", &url, &sha256(&body), &ctx);
    fetcher.fetch().unwrap();
    assert!(!fetcher.fetch_required().unwrap());

    // A second fetch reuses the download.
    fetcher.fetch().unwrap();
    mock.assert();

    let changed = NetworkFetcher::new("zlib", &url, &sha256(b"a newer release"), &ctx);
    assert!(changed.fetch_required().unwrap());
  }

  #[test]
  fn tampered_download_is_fetched_again() {
    let body = tarball();
    let mut server = Server::new();
    server.mock("GET", "/zlib.tar.gz").with_body(&body).create();

    let temp = TempDir::new().unwrap();
    let ctx = context(&temp, 0);
    let url = format!("{}/zlib.tar.gz", server.url());
    let fetcher = NetworkFetcher::new("zlib", &url, &sha256(&body), &ctx);
    fetcher.fetch().unwrap();

    fs::write(fetcher.archive_path(), b"tampered").unwrap();
    assert!(fetcher.fetch_required().unwrap());
    assert!(matches!(
      fetcher.verify_checksum(),
      Err(FetchError::ChecksumMismatch { .. })
    ));
  }

  #[test]
  fn checksum_mismatch_is_not_retried() {
    let mut server = Server::new();
    let mock = server
      .mock("GET", "/zlib.tar.gz")
      .with_body(tarball())
      .expect(1)
      .create();

    let temp = TempDir::new().unwrap();
    let ctx = context(&temp, 3);
    let url = format!("{}/zlib.tar.gz", server.url());
    let fetcher = NetworkFetcher::new("zlib", &url, &sha256(b"something else"), &ctx);

    let err = fetcher.fetch().unwrap_err();
    mock.assert();
    assert!(err.is_integrity());
    assert!(!fetcher.archive_path().exists());
  }

  #[test]
  fn server_errors_exhaust_retries() {
    let mut server = Server::new();
    let mock = server
      .mock("GET", "/zlib.tar.gz")
      .with_status(503)
      .expect(3)
      .create();

    let temp = TempDir::new().unwrap();
    let ctx = context(&temp, 2);
    let url = format!("{}/zlib.tar.gz", server.url());
    let fetcher = NetworkFetcher::new("zlib", &url, &sha256(b"x"), &ctx);

    let err = fetcher.fetch().unwrap_err();
    mock.assert();
    assert!(matches!(
      err,
      FetchError::RetriesExhausted { attempts: 3, .. }
    ));
  }

  #[test]
  fn not_found_fails_immediately() {
    let mut server = Server::new();
    let mock = server
      .mock("GET", "/zlib.tar.gz")
      .with_status(404)
      .expect(1)
      .create();

    let temp = TempDir::new().unwrap();
    let ctx = context(&temp, 3);
    let url = format!("{}/zlib.tar.gz", server.url());
    let fetcher = NetworkFetcher::new("zlib", &url, &sha256(b"x"), &ctx);

    let err = with_retries("zlib", 3, || fetcher.attempt()).unwrap_err();
    mock.assert();
    assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
  }

  #[test]
  fn verify_before_fetch_reports_not_fetched() {
    let temp = TempDir::new().unwrap();
    let ctx = context(&temp, 0);
    let fetcher = NetworkFetcher::new("zlib", "https://example.invalid/zlib.tar.gz", &sha256(b"x"), &ctx);
    assert!(matches!(
      fetcher.verify_checksum(),
      Err(FetchError::NotFetched { .. })
    ));
  }
}
