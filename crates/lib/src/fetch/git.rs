//! Git sources.
//!
//! Each component gets a mirror under `{cache_dir}/git/{name}` that is cloned
//! once and fetched on later runs. The resolved commit's tree is exported into
//! the component's source directory without any `.git` metadata, so builds
//! never see the repository itself.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use gix::bstr::ByteSlice;
use gix::objs::tree::EntryKind;
use gix::remote::Direction;
use tracing::{debug, info};

use super::SourceFetcher;
use super::types::{FetchContext, FetchError, FetchResult};

/// Identity used for reflog entries when the host configures none. A real
/// `user.name`/`user.email` still wins.
const IDENTITY_FALLBACK: [&str; 2] = [
  "gitoxide.committer.nameFallback=stackwright",
  "gitoxide.committer.emailFallback=stackwright@localhost",
];

/// Fetches a `vcs` source.
#[derive(Debug)]
pub struct GitFetcher {
  component: String,
  remote: String,
  revision: String,
  mirror: PathBuf,
  source: PathBuf,
  retries: u32,
  resolved: OnceLock<String>,
}

impl GitFetcher {
  pub fn new(component: &str, remote: &str, revision: &str, ctx: &FetchContext) -> Self {
    Self {
      component: component.to_string(),
      remote: remote.to_string(),
      revision: revision.to_string(),
      mirror: ctx.mirror_path(component),
      source: ctx.source_path(component),
      retries: ctx.retries,
      resolved: OnceLock::new(),
    }
  }

  /// Records which commit is currently exported to the source directory.
  fn marker_path(&self) -> PathBuf {
    let mut name = self.mirror.as_os_str().to_owned();
    name.push(".checkout");
    PathBuf::from(name)
  }

  fn checked_out(&self) -> Option<String> {
    fs::read_to_string(self.marker_path())
      .ok()
      .map(|content| content.trim().to_string())
  }

  fn git_err(&self, error: impl std::fmt::Display) -> FetchError {
    FetchError::Git {
      remote: self.remote.clone(),
      message: error.to_string(),
    }
  }

  fn transport_err(&self, error: impl std::error::Error + Send + Sync + 'static) -> FetchError {
    FetchError::GitTransport {
      remote: self.remote.clone(),
      source: Box::new(error),
    }
  }

  fn open_mirror(&self) -> Result<gix::Repository, FetchError> {
    let options = gix::open::Options::default().config_overrides(IDENTITY_FALLBACK);
    gix::open_opts(&self.mirror, options).map_err(|e| self.git_err(e))
  }

  /// The mirror, synced first unless it already holds `commit`.
  fn mirror_with(&self, commit: gix::ObjectId) -> Result<gix::Repository, FetchError> {
    if self.mirror.join(".git").exists() {
      let repo = self.open_mirror()?;
      if repo.find_commit(commit).is_ok() {
        return Ok(repo);
      }
    }
    self.sync_mirror()
  }

  /// Clone the mirror if absent, otherwise fetch updates into it.
  fn sync_mirror(&self) -> Result<gix::Repository, FetchError> {
    if self.mirror.join(".git").exists() {
      debug!(component = %self.component, path = %self.mirror.display(), "updating mirror");
      let repo = self.open_mirror()?;
      self.fetch_updates(&repo)?;
      return Ok(repo);
    }

    if self.mirror.exists() {
      // Leftover from an interrupted clone.
      fs::remove_dir_all(&self.mirror).map_err(FetchError::io(&self.mirror))?;
    }
    if let Some(parent) = self.mirror.parent() {
      fs::create_dir_all(parent).map_err(FetchError::io(parent))?;
    }

    info!(component = %self.component, remote = %self.remote, "cloning");
    self.clone_mirror()
  }

  fn clone_mirror(&self) -> Result<gix::Repository, FetchError> {
    let result = (|| -> Result<gix::Repository, FetchError> {
      let mut prepared = gix::prepare_clone(self.remote.as_str(), &self.mirror)
        .map_err(|e| self.transport_err(e))?
        .with_in_memory_config_overrides(IDENTITY_FALLBACK);
      let (mut checkout, _outcome) = prepared
        .fetch_then_checkout(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
        .map_err(|e| self.transport_err(e))?;
      let (repo, _outcome) = checkout
        .main_worktree(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
        .map_err(|e| self.git_err(e))?;
      Ok(repo)
    })();

    if result.is_err() {
      let _ = fs::remove_dir_all(&self.mirror);
    }
    result
  }

  fn fetch_updates(&self, repo: &gix::Repository) -> Result<(), FetchError> {
    let remote = repo
      .find_default_remote(Direction::Fetch)
      .ok_or_else(|| self.git_err("mirror has no remote configured"))?
      .map_err(|e| self.git_err(e))?;

    let connection = remote.connect(Direction::Fetch).map_err(|e| self.transport_err(e))?;
    connection
      .prepare_fetch(gix::progress::Discard, Default::default())
      .map_err(|e| self.transport_err(e))?
      .receive(gix::progress::Discard, &gix::interrupt::IS_INTERRUPTED)
      .map_err(|e| match e {
        // Writing refs is local; retrying cannot help.
        gix::remote::fetch::Error::UpdateRefs(_) => self.git_err(e),
        other => self.transport_err(other),
      })?;
    Ok(())
  }

  /// Resolve the declared revision to a commit id.
  ///
  /// Remote-tracking refs win over local ones so that branch names follow
  /// the remote after a fetch.
  fn resolve_revision(&self, repo: &gix::Repository) -> Result<gix::ObjectId, FetchError> {
    let mut candidates = vec![format!("origin/{}", self.revision)];
    if self.revision == "HEAD"
      && let Ok(Some(branch)) = repo.head_name()
    {
      candidates.push(format!("origin/{}", branch.shorten()));
    }
    candidates.push(self.revision.clone());

    for candidate in &candidates {
      let Ok(spec) = repo.rev_parse(candidate.as_str()) else {
        continue;
      };
      let Some(id) = spec.single() else {
        continue;
      };
      let commit = id
        .object()
        .map_err(|e| self.git_err(e))?
        .peel_to_commit()
        .map_err(|e| self.git_err(e))?;
      return Ok(commit.id);
    }

    Err(FetchError::RevisionNotFound {
      remote: self.remote.clone(),
      revision: self.revision.clone(),
    })
  }

  /// Write the tree of `commit` into the source directory.
  fn export(&self, repo: &gix::Repository, commit: gix::ObjectId) -> Result<(), FetchError> {
    if self.source.exists() {
      fs::remove_dir_all(&self.source).map_err(FetchError::io(&self.source))?;
    }
    fs::create_dir_all(&self.source).map_err(FetchError::io(&self.source))?;

    let tree = repo
      .find_commit(commit)
      .map_err(|e| self.git_err(e))?
      .tree()
      .map_err(|e| self.git_err(e))?;

    let mut recorder = gix::traverse::tree::Recorder::default();
    tree.traverse().breadthfirst(&mut recorder).map_err(|e| self.git_err(e))?;

    let mut files = 0usize;
    for entry in recorder.records {
      let relative = entry.filepath.to_str_lossy();
      let target = self.source.join(&*relative);

      match entry.mode.kind() {
        EntryKind::Tree => {
          fs::create_dir_all(&target).map_err(FetchError::io(&target))?;
        }
        EntryKind::Blob | EntryKind::BlobExecutable => {
          let object = repo.find_object(entry.oid).map_err(|e| self.git_err(e))?;
          write_file(&target, &object.data)?;
          if entry.mode.kind() == EntryKind::BlobExecutable {
            set_executable(&target)?;
          }
          files += 1;
        }
        EntryKind::Link => {
          let object = repo.find_object(entry.oid).map_err(|e| self.git_err(e))?;
          let link = object.data.to_str_lossy().into_owned();
          write_symlink(&link, &target)?;
        }
        EntryKind::Commit => {
          debug!(component = %self.component, path = %relative, "skipping submodule");
        }
      }
    }

    debug!(component = %self.component, commit = %commit, files, "exported tree");
    Ok(())
  }
}

impl SourceFetcher for GitFetcher {
  fn component(&self) -> &str {
    &self.component
  }

  fn retries(&self) -> u32 {
    self.retries
  }

  /// Sync the mirror and resolve the declared revision.
  ///
  /// The commit is remembered for the lifetime of this fetcher (or pinned
  /// up front), so a run builds exactly the commit its fingerprint was
  /// computed from.
  fn resolve_version(&self) -> Result<String, FetchError> {
    if let Some(commit) = self.resolved.get() {
      return Ok(commit.clone());
    }

    let repo = self.sync_mirror()?;
    let commit = self.resolve_revision(&repo)?.to_string();
    debug!(component = %self.component, revision = %self.revision, commit = %commit, "resolved revision");
    Ok(self.resolved.get_or_init(|| commit).clone())
  }

  fn pin(&self, identity: &str) {
    let _ = self.resolved.set(identity.to_string());
  }

  fn fetch_required(&self) -> Result<bool, FetchError> {
    if !self.source.is_dir() {
      return Ok(true);
    }
    let Some(current) = self.checked_out() else {
      return Ok(true);
    };
    Ok(current != self.resolve_version()?)
  }

  fn attempt(&self) -> Result<FetchResult, FetchError> {
    let commit = self.resolve_version()?;

    if self.fetch_required()? {
      let id = gix::ObjectId::from_hex(commit.as_bytes()).map_err(|e| self.git_err(e))?;
      let repo = self.mirror_with(id)?;

      // The marker only ever names a completely exported tree.
      let marker = self.marker_path();
      if marker.exists() {
        fs::remove_file(&marker).map_err(FetchError::io(&marker))?;
      }
      self.export(&repo, id)?;
      fs::write(&marker, &commit).map_err(FetchError::io(&marker))?;
    } else {
      debug!(component = %self.component, commit = %commit, "checkout is current");
    }

    Ok(FetchResult {
      version: commit,
      path: self.source.clone(),
      verified: true,
    })
  }

  /// Compare the exported commit with the resolved one.
  fn verify_checksum(&self) -> Result<(), FetchError> {
    let current = self.checked_out().ok_or_else(|| FetchError::NotFetched {
      component: self.component.clone(),
    })?;
    let expected = self.resolve_version()?;
    if current != expected {
      return Err(FetchError::ChecksumMismatch {
        component: self.component.clone(),
        expected,
        actual: current,
      });
    }
    Ok(())
  }
}

fn write_file(path: &Path, data: &[u8]) -> Result<(), FetchError> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).map_err(FetchError::io(parent))?;
  }
  fs::write(path, data).map_err(FetchError::io(path))
}

#[cfg(unix)]
fn set_executable(path: &Path) -> Result<(), FetchError> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(FetchError::io(path))
}

#[cfg(windows)]
fn set_executable(_path: &Path) -> Result<(), FetchError> {
  Ok(())
}

#[cfg(unix)]
fn write_symlink(link: &str, path: &Path) -> Result<(), FetchError> {
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).map_err(FetchError::io(parent))?;
  }
  std::os::unix::fs::symlink(link, path).map_err(FetchError::io(path))
}

#[cfg(windows)]
fn write_symlink(link: &str, path: &Path) -> Result<(), FetchError> {
  // Without symlink privileges, keep the link target as file content like git does.
  write_file(path, link.as_bytes())
}
