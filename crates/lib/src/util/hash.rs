//! Digests used for fingerprints, local source identities, snapshot objects
//! and download verification (SHA-256), plus a fast XXH3 digest for
//! freshness stamps.

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;
use xxhash_rust::xxh3::Xxh3;

/// Lowercase hex SHA-256 (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Error)]
pub enum HashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Digest of a directory tree: relative paths, file contents and symlink
/// targets. Timestamps and permissions are ignored, so a fresh checkout of
/// the same content hashes the same.
///
/// Entries named in `exclude` (e.g. `&[".git"]`) are skipped with everything
/// below them. Sockets, devices and fifos are ignored.
pub fn hash_directory(path: &Path, exclude: &[&str]) -> Result<ContentHash, HashError> {
  let walker = WalkDir::new(path)
    .min_depth(1)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| e.file_name().to_str().is_none_or(|name| !exclude.contains(&name)));

  let mut hasher = Sha256::new();
  for entry in walker {
    let entry = entry.map_err(|e| HashError::WalkDir { message: e.to_string() })?;
    let relative = entry
      .path()
      .strip_prefix(path)
      .unwrap_or(entry.path())
      .to_string_lossy()
      .replace('\\', "/");

    let file_type = entry.file_type();
    let record = if file_type.is_dir() {
      format!("D:{}", relative)
    } else if file_type.is_file() {
      format!("F:{}:{}", relative, hash_file(entry.path())?)
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry.path()).map_err(|e| HashError::ReadSymlink {
        path: entry.path().display().to_string(),
        message: e.to_string(),
      })?;
      format!("L:{}:{}", relative, target.to_string_lossy())
    } else {
      continue;
    };

    hasher.update(record.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// SHA-256 of a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, HashError> {
  let mut hasher = Sha256::new();
  stream_file(path, |chunk| hasher.update(chunk))?;
  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// SHA-256 of arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(hex::encode(Sha256::digest(data)))
}

/// XXH3-64 of a file as 16 lowercase hex characters.
///
/// Not collision resistant; only used to notice that an already verified
/// artifact changed on disk.
pub fn fast_file_digest(path: &Path) -> Result<String, HashError> {
  let mut hasher = Xxh3::new();
  stream_file(path, |chunk| hasher.update(chunk))?;
  Ok(format!("{:016x}", hasher.digest()))
}

fn stream_file(path: &Path, mut consume: impl FnMut(&[u8])) -> Result<(), HashError> {
  let read_err = |e: std::io::Error| HashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  };

  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut buffer = vec![0u8; 64 * 1024];
  loop {
    let read = file.read(&mut buffer).map_err(read_err)?;
    if read == 0 {
      return Ok(());
    }
    consume(&buffer[..read]);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  #[test]
  fn empty_directory_has_a_digest() {
    let temp = tempdir().unwrap();
    let hash = hash_directory(temp.path(), &[]).unwrap();
    assert_eq!(hash.0.len(), 64);
  }

  #[test]
  fn directory_digest_is_stable() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("a.txt"), "content a").unwrap();
    fs::write(temp.path().join("b.txt"), "content b").unwrap();

    let hash1 = hash_directory(temp.path(), &[]).unwrap();
    let hash2 = hash_directory(temp.path(), &[]).unwrap();

    assert_eq!(hash1, hash2);
  }

  #[test]
  fn editing_a_file_changes_the_digest() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("file.txt"), "original").unwrap();
    let hash1 = hash_directory(temp.path(), &[]).unwrap();

    fs::write(temp.path().join("file.txt"), "modified").unwrap();
    let hash2 = hash_directory(temp.path(), &[]).unwrap();

    assert_ne!(hash1, hash2);
  }

  #[test]
  fn excluded_entries_are_ignored() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("file.txt"), "content").unwrap();
    let hash1 = hash_directory(temp.path(), &[]).unwrap();

    fs::create_dir(temp.path().join(".git")).unwrap();
    fs::write(temp.path().join(".git/HEAD"), "ref: refs/heads/main").unwrap();

    let hash2 = hash_directory(temp.path(), &[".git"]).unwrap();
    assert_eq!(hash1, hash2);
  }

  #[test]
  fn moving_a_file_changes_the_digest() {
    let temp1 = tempdir().unwrap();
    fs::write(temp1.path().join("file.txt"), "content").unwrap();

    let temp2 = tempdir().unwrap();
    fs::create_dir(temp2.path().join("subdir")).unwrap();
    fs::write(temp2.path().join("subdir/file.txt"), "content").unwrap();

    let hash1 = hash_directory(temp1.path(), &[]).unwrap();
    let hash2 = hash_directory(temp2.path(), &[]).unwrap();

    assert_ne!(hash1, hash2);
  }

  #[test]
  fn hash_file_matches_hash_bytes() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("test.txt");
    fs::write(&file_path, "hello world").unwrap();

    assert_eq!(hash_file(&file_path).unwrap(), hash_bytes(b"hello world"));
    assert_eq!(
      hash_bytes(b"hello world").0,
      "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
    );
  }

  #[test]
  fn fast_digest_tracks_content() {
    let temp = tempdir().unwrap();
    let file_path = temp.path().join("artifact.tar.gz");
    fs::write(&file_path, "v1").unwrap();
    let first = fast_file_digest(&file_path).unwrap();
    assert_eq!(first.len(), 16);
    assert_eq!(first, fast_file_digest(&file_path).unwrap());

    fs::write(&file_path, "v2").unwrap();
    assert_ne!(first, fast_file_digest(&file_path).unwrap());
  }
}
