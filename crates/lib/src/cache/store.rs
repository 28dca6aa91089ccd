//! Snapshot stores for the shared install root.
//!
//! # Storage Layout
//!
//! ```text
//! {snapshot_dir}/{root-digest}/
//! ├── HEAD                  # tree digest of the last committed or restored state
//! ├── objects/ab/cdef...    # file contents, addressed by SHA-256
//! ├── trees/<digest>.json   # tree manifests
//! └── tags/<tag>            # tag -> tree digest
//! ```
//!
//! `{root-digest}` is derived from the install root path with any drive
//! letter removed, so the same root maps to the same store on every platform.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::platform::paths::portable_path;
use crate::pool::ConcurrencyPool;
use crate::util::hash::{HashError, hash_bytes, hash_file};

/// Result of committing the install root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commit {
  /// New content was recorded.
  Recorded,
  /// The tree equals the last committed or restored state.
  Unchanged,
}

#[derive(Debug, Error)]
pub enum CacheStoreError {
  #[error("snapshot tag '{0}' does not exist")]
  TagNotFound(String),

  #[error("snapshot object {0} is missing from the store")]
  MissingObject(String),

  #[error("corrupt snapshot record '{path}': {source}")]
  Corrupt {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to walk '{path}': {message}")]
  Walk { path: PathBuf, message: String },

  #[error("i/o error at '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error("failed to start hashing workers: {0}")]
  Workers(#[source] io::Error),
}

impl CacheStoreError {
  fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> CacheStoreError {
    let path = path.into();
    move |source| CacheStoreError::Io { path, source }
  }
}

/// A tag-addressable store of install root states.
///
/// One instance serves exactly one install root. Implementations are not
/// required to be safe for concurrent use.
pub trait SnapshotStore {
  /// Commit the current state of the install root under `tag`.
  fn put(&mut self, tag: &str) -> Result<Commit, CacheStoreError>;

  /// Make the install root exactly match the state committed under `tag`.
  fn get(&mut self, tag: &str) -> Result<(), CacheStoreError>;

  /// Whether `tag` has been committed.
  fn exists(&self, tag: &str) -> Result<bool, CacheStoreError>;
}

/// One entry of a tree manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Entry {
  Dir,
  File { digest: String, executable: bool },
  Symlink { target: String },
}

/// Marks a tree key holding the hex-encoded raw bytes of a path that is not
/// valid UTF-8. NUL never occurs in a file name.
const RAW_PATH_PREFIX: char = '\0';

/// Relative path (`/`-separated, or raw-encoded) to entry.
type Tree = BTreeMap<String, Entry>;

/// Directory-backed reference store.
#[derive(Debug)]
pub struct DirSnapshotStore {
  base_path: PathBuf,
  install_root: PathBuf,
  workers: usize,
}

impl DirSnapshotStore {
  /// Open (or lazily create) the store of `install_root` below `snapshot_dir`.
  pub fn for_install_root(snapshot_dir: &Path, install_root: &Path, workers: usize) -> Self {
    let key = hash_bytes(portable_path(install_root).as_bytes()).0;
    Self {
      base_path: snapshot_dir.join(&key[..16]),
      install_root: install_root.to_path_buf(),
      workers: workers.max(1),
    }
  }

  pub fn base_path(&self) -> &Path {
    &self.base_path
  }

  pub fn install_root(&self) -> &Path {
    &self.install_root
  }

  fn head_path(&self) -> PathBuf {
    self.base_path.join("HEAD")
  }

  fn tag_path(&self, tag: &str) -> PathBuf {
    self.base_path.join("tags").join(tag)
  }

  fn tree_path(&self, digest: &str) -> PathBuf {
    self.base_path.join("trees").join(format!("{}.json", digest))
  }

  fn object_path(&self, digest: &str) -> PathBuf {
    let (prefix, rest) = digest.split_at(2.min(digest.len()));
    self.base_path.join("objects").join(prefix).join(rest)
  }

  fn read_head(&self) -> Option<String> {
    fs::read_to_string(self.head_path())
      .ok()
      .map(|content| content.trim().to_string())
  }

  fn read_tree(&self, digest: &str) -> Result<Tree, CacheStoreError> {
    let path = self.tree_path(digest);
    let content = fs::read_to_string(&path).map_err(CacheStoreError::io(&path))?;
    serde_json::from_str(&content).map_err(|source| CacheStoreError::Corrupt { path, source })
  }

  /// Scan the install root into a tree manifest.
  ///
  /// File contents are hashed on a worker pool; the result is identical to
  /// a sequential scan.
  fn scan(&self) -> Result<Tree, CacheStoreError> {
    let mut tree = Tree::new();
    if !self.install_root.exists() {
      return Ok(tree);
    }

    let mut files: Vec<(String, PathBuf, bool)> = Vec::new();
    for entry in WalkDir::new(&self.install_root).min_depth(1).sort_by_file_name() {
      let entry = entry.map_err(|e| CacheStoreError::Walk {
        path: self.install_root.clone(),
        message: e.to_string(),
      })?;
      let relative = relative_key(&self.install_root, entry.path());
      let file_type = entry.file_type();

      if file_type.is_dir() {
        tree.insert(relative, Entry::Dir);
      } else if file_type.is_symlink() {
        let target = fs::read_link(entry.path()).map_err(CacheStoreError::io(entry.path()))?;
        tree.insert(
          relative,
          Entry::Symlink {
            target: encode_path(&target),
          },
        );
      } else if file_type.is_file() {
        let metadata = entry.metadata().map_err(|e| CacheStoreError::Walk {
          path: entry.path().to_path_buf(),
          message: e.to_string(),
        })?;
        files.push((relative, entry.path().to_path_buf(), is_executable(&metadata)));
      }
    }

    let slots: Arc<Mutex<Vec<Option<Result<String, HashError>>>>> =
      Arc::new(Mutex::new((0..files.len()).map(|_| None).collect()));

    let pool = ConcurrencyPool::new(self.workers.min(files.len().max(1))).map_err(CacheStoreError::Workers)?;
    for (index, (_, path, _)) in files.iter().enumerate() {
      let slots = Arc::clone(&slots);
      let path = path.clone();
      pool.schedule(move || {
        let digest = hash_file(&path).map(|hash| hash.0);
        slots.lock()[index] = Some(digest);
      });
    }
    pool.shutdown();

    let mut digests = slots.lock();
    for ((relative, path, executable), slot) in files.into_iter().zip(digests.iter_mut()) {
      let digest = match slot.take() {
        Some(result) => result?,
        None => hash_file(&path)?.0,
      };
      tree.insert(relative, Entry::File { digest, executable });
    }

    debug!(root = %self.install_root.display(), entries = tree.len(), "scanned install root");
    Ok(tree)
  }

  /// Copy every file of `tree` that is not yet an object into the store.
  fn store_objects(&self, tree: &Tree) -> Result<usize, CacheStoreError> {
    let mut stored = 0;
    for (relative, entry) in tree {
      let Entry::File { digest, .. } = entry else {
        continue;
      };
      let object = self.object_path(digest);
      if object.exists() {
        continue;
      }
      if let Some(parent) = object.parent() {
        fs::create_dir_all(parent).map_err(CacheStoreError::io(parent))?;
      }
      let source = self.install_root.join(decode_path(relative));
      let temp = object.with_extension("tmp");
      fs::copy(&source, &temp).map_err(CacheStoreError::io(&source))?;
      fs::rename(&temp, &object).map_err(CacheStoreError::io(&object))?;
      stored += 1;
    }
    Ok(stored)
  }

  fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<(), CacheStoreError> {
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(CacheStoreError::io(parent))?;
    }
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    fs::write(&temp, content).map_err(CacheStoreError::io(&temp))?;
    fs::rename(&temp, path).map_err(CacheStoreError::io(path))
  }

  /// Remove everything under the install root that `tree` does not describe
  /// with the same entry kind.
  fn prune(&self, tree: &Tree) -> Result<usize, CacheStoreError> {
    let mut removed = 0;
    let walker = WalkDir::new(&self.install_root).min_depth(1).contents_first(true);
    for entry in walker {
      let entry = entry.map_err(|e| CacheStoreError::Walk {
        path: self.install_root.clone(),
        message: e.to_string(),
      })?;
      let relative = relative_key(&self.install_root, entry.path());
      let file_type = entry.file_type();

      let keep = match tree.get(&relative) {
        Some(Entry::Dir) => file_type.is_dir(),
        Some(Entry::File { .. }) => file_type.is_file(),
        Some(Entry::Symlink { .. }) => file_type.is_symlink(),
        None => false,
      };
      if keep {
        continue;
      }

      let path = entry.path();
      if file_type.is_dir() {
        fs::remove_dir_all(path).map_err(CacheStoreError::io(path))?;
      } else {
        fs::remove_file(path).map_err(CacheStoreError::io(path))?;
      }
      removed += 1;
    }
    Ok(removed)
  }

  /// Write every entry of `tree` that differs from the install root.
  fn materialize(&self, tree: &Tree) -> Result<usize, CacheStoreError> {
    let mut written = 0;
    for (relative, entry) in tree {
      let target = self.install_root.join(decode_path(relative));
      // Raw-encoded keys sort before their parent directory's key.
      if !matches!(entry, Entry::Dir)
        && let Some(parent) = target.parent()
      {
        fs::create_dir_all(parent).map_err(CacheStoreError::io(parent))?;
      }
      match entry {
        Entry::Dir => {
          fs::create_dir_all(&target).map_err(CacheStoreError::io(&target))?;
        }
        Entry::File { digest, executable } => {
          let current = target.is_file().then(|| hash_file(&target)).transpose()?;
          if current.is_some_and(|hash| &hash.0 == digest) {
            set_executable(&target, *executable)?;
            continue;
          }
          let object = self.object_path(digest);
          if !object.exists() {
            return Err(CacheStoreError::MissingObject(digest.clone()));
          }
          if target.exists() {
            fs::remove_file(&target).map_err(CacheStoreError::io(&target))?;
          }
          fs::copy(&object, &target).map_err(CacheStoreError::io(&target))?;
          set_executable(&target, *executable)?;
          written += 1;
        }
        Entry::Symlink { target: link } => {
          let link = decode_path(link);
          if fs::read_link(&target).is_ok_and(|current| current == link) {
            continue;
          }
          if target.symlink_metadata().is_ok() {
            fs::remove_file(&target).map_err(CacheStoreError::io(&target))?;
          }
          create_symlink(&link, &target)?;
          written += 1;
        }
      }
    }
    Ok(written)
  }
}

impl SnapshotStore for DirSnapshotStore {
  fn put(&mut self, tag: &str) -> Result<Commit, CacheStoreError> {
    let tree = self.scan()?;
    // Serializing a map of strings cannot fail.
    let serialized = serde_json::to_vec_pretty(&tree).unwrap_or_default();
    let digest = hash_bytes(&serialized).0;

    let unchanged = self.read_head().as_deref() == Some(digest.as_str());

    let stored = self.store_objects(&tree)?;
    let tree_path = self.tree_path(&digest);
    if !tree_path.exists() {
      self.write_atomic(&tree_path, &serialized)?;
    }
    self.write_atomic(&self.tag_path(tag), digest.as_bytes())?;
    self.write_atomic(&self.head_path(), digest.as_bytes())?;

    if unchanged {
      debug!(tag, "install root unchanged since last commit");
      Ok(Commit::Unchanged)
    } else {
      info!(tag, objects = stored, "committed install root");
      Ok(Commit::Recorded)
    }
  }

  fn get(&mut self, tag: &str) -> Result<(), CacheStoreError> {
    let tag_path = self.tag_path(tag);
    let digest = match fs::read_to_string(&tag_path) {
      Ok(content) => content.trim().to_string(),
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(CacheStoreError::TagNotFound(tag.to_string())),
      Err(e) => return Err(CacheStoreError::io(&tag_path)(e)),
    };
    let tree = self.read_tree(&digest)?;

    fs::create_dir_all(&self.install_root).map_err(CacheStoreError::io(&self.install_root))?;
    let removed = self.prune(&tree)?;
    let written = self.materialize(&tree)?;
    self.write_atomic(&self.head_path(), digest.as_bytes())?;

    debug!(tag, removed, written, "restored install root");
    Ok(())
  }

  fn exists(&self, tag: &str) -> Result<bool, CacheStoreError> {
    Ok(self.tag_path(tag).is_file())
  }
}

fn relative_key(root: &Path, path: &Path) -> String {
  encode_path(path.strip_prefix(root).unwrap_or(path))
}

/// Encode a path as a tree key without losing bytes.
fn encode_path(path: &Path) -> String {
  match path.to_str() {
    Some(text) if cfg!(windows) => text.replace('\\', "/"),
    Some(text) => text.to_string(),
    None => format!("{}{}", RAW_PATH_PREFIX, hex::encode(raw_bytes(path.as_os_str()))),
  }
}

fn decode_path(key: &str) -> PathBuf {
  match key.strip_prefix(RAW_PATH_PREFIX).and_then(|raw| hex::decode(raw).ok()) {
    Some(bytes) => PathBuf::from(from_raw_bytes(bytes)),
    None => PathBuf::from(key),
  }
}

#[cfg(unix)]
fn raw_bytes(os: &OsStr) -> Vec<u8> {
  use std::os::unix::ffi::OsStrExt;
  os.as_bytes().to_vec()
}

#[cfg(unix)]
fn from_raw_bytes(bytes: Vec<u8>) -> OsString {
  use std::os::unix::ffi::OsStringExt;
  OsString::from_vec(bytes)
}

#[cfg(windows)]
fn raw_bytes(os: &OsStr) -> Vec<u8> {
  use std::os::windows::ffi::OsStrExt;
  os.encode_wide().flat_map(u16::to_le_bytes).collect()
}

#[cfg(windows)]
fn from_raw_bytes(bytes: Vec<u8>) -> OsString {
  use std::os::windows::ffi::OsStringExt;
  let wide: Vec<u16> = bytes
    .chunks_exact(2)
    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
    .collect();
  OsString::from_wide(&wide)
}

#[cfg(unix)]
fn is_executable(metadata: &fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o111 != 0
}

#[cfg(windows)]
fn is_executable(_metadata: &fs::Metadata) -> bool {
  false
}

#[cfg(unix)]
fn set_executable(path: &Path, executable: bool) -> Result<(), CacheStoreError> {
  use std::os::unix::fs::PermissionsExt;
  let mode = if executable { 0o755 } else { 0o644 };
  fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(CacheStoreError::io(path))
}

#[cfg(windows)]
fn set_executable(_path: &Path, _executable: bool) -> Result<(), CacheStoreError> {
  Ok(())
}

#[cfg(unix)]
fn create_symlink(link: &Path, path: &Path) -> Result<(), CacheStoreError> {
  std::os::unix::fs::symlink(link, path).map_err(CacheStoreError::io(path))
}

#[cfg(windows)]
fn create_symlink(link: &Path, path: &Path) -> Result<(), CacheStoreError> {
  std::os::windows::fs::symlink_file(link, path).map_err(CacheStoreError::io(path))
}
