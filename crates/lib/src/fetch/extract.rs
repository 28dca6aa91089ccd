//! Unpacking downloaded artifacts into a component's source directory.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;
use walkdir::WalkDir;

use super::types::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
  TarGz,
  Tar,
  Zip,
  Plain,
}

impl ArchiveKind {
  fn detect(path: &Path) -> Self {
    let name = path
      .file_name()
      .map(|n| n.to_string_lossy().to_ascii_lowercase())
      .unwrap_or_default();

    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
      ArchiveKind::TarGz
    } else if name.ends_with(".tar") {
      ArchiveKind::Tar
    } else if name.ends_with(".zip") {
      ArchiveKind::Zip
    } else {
      ArchiveKind::Plain
    }
  }
}

/// Unpack `archive` into a fresh `dest` directory.
///
/// Any previous content of `dest` is removed first. Files that are not a
/// recognized archive (`.tar.gz`, `.tgz`, `.tar`, `.zip`) are copied into
/// `dest` unchanged.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<(), FetchError> {
  if dest.exists() {
    fs::remove_dir_all(dest).map_err(FetchError::io(dest))?;
  }
  fs::create_dir_all(dest).map_err(FetchError::io(dest))?;

  let kind = ArchiveKind::detect(archive);
  debug!(archive = %archive.display(), dest = %dest.display(), ?kind, "extracting");

  let extract_err = |message: String| FetchError::Extract {
    archive: archive.to_path_buf(),
    message,
  };

  match kind {
    ArchiveKind::TarGz => {
      let file = File::open(archive).map_err(FetchError::io(archive))?;
      let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
      tar.set_preserve_permissions(true);
      tar.unpack(dest).map_err(|e| extract_err(e.to_string()))
    }
    ArchiveKind::Tar => {
      let file = File::open(archive).map_err(FetchError::io(archive))?;
      let mut tar = tar::Archive::new(BufReader::new(file));
      tar.set_preserve_permissions(true);
      tar.unpack(dest).map_err(|e| extract_err(e.to_string()))
    }
    ArchiveKind::Zip => {
      let file = File::open(archive).map_err(FetchError::io(archive))?;
      let mut zip = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| extract_err(e.to_string()))?;
      zip.extract(dest).map_err(|e| extract_err(e.to_string()))
    }
    ArchiveKind::Plain => {
      let name = archive
        .file_name()
        .ok_or_else(|| extract_err("artifact has no file name".to_string()))?;
      let target = dest.join(name);
      fs::copy(archive, &target).map_err(FetchError::io(&target))?;
      Ok(())
    }
  }
}

/// Copy the tree at `src` into a fresh `dest` directory.
///
/// Entries named in `exclude` are skipped with everything below them.
/// Permissions and symlinks are preserved; other special files are ignored.
pub fn copy_tree(src: &Path, dest: &Path, exclude: &[&str]) -> Result<usize, FetchError> {
  if dest.exists() {
    fs::remove_dir_all(dest).map_err(FetchError::io(dest))?;
  }
  fs::create_dir_all(dest).map_err(FetchError::io(dest))?;

  let walker = WalkDir::new(src)
    .min_depth(1)
    .into_iter()
    .filter_entry(|e| e.file_name().to_str().is_none_or(|name| !exclude.contains(&name)));

  let mut files = 0;
  for entry in walker {
    let entry = entry.map_err(|e| FetchError::Io {
      path: e.path().unwrap_or(src).to_path_buf(),
      source: e.into(),
    })?;
    let target = dest.join(entry.path().strip_prefix(src).unwrap_or(entry.path()));
    let file_type = entry.file_type();

    if file_type.is_dir() {
      fs::create_dir_all(&target).map_err(FetchError::io(&target))?;
    } else if file_type.is_symlink() {
      let link = fs::read_link(entry.path()).map_err(FetchError::io(entry.path()))?;
      copy_symlink(&link, entry.path(), &target)?;
    } else if file_type.is_file() {
      fs::copy(entry.path(), &target).map_err(FetchError::io(&target))?;
      files += 1;
    }
  }

  debug!(src = %src.display(), dest = %dest.display(), files, "copied source tree");
  Ok(files)
}

#[cfg(unix)]
fn copy_symlink(link: &Path, _original: &Path, target: &Path) -> Result<(), FetchError> {
  std::os::unix::fs::symlink(link, target).map_err(FetchError::io(target))
}

#[cfg(windows)]
fn copy_symlink(_link: &Path, original: &Path, target: &Path) -> Result<(), FetchError> {
  // Without symlink privileges, copy what the link points at.
  fs::copy(original, target).map(|_| ()).map_err(FetchError::io(target))
}

/// The directory a build should run in.
///
/// Archives conventionally wrap their content in one top-level directory
/// (`zlib-1.3.1/`); when `dir` holds exactly one directory and nothing else,
/// that directory is returned, otherwise `dir` itself.
pub fn source_root(dir: &Path) -> Result<PathBuf, FetchError> {
  let mut entries = fs::read_dir(dir)
    .map_err(FetchError::io(dir))?
    .collect::<Result<Vec<_>, _>>()
    .map_err(FetchError::io(dir))?;

  if entries.len() == 1 {
    let entry = entries.remove(0);
    let is_dir = entry.file_type().map_err(FetchError::io(entry.path()))?.is_dir();
    if is_dir {
      return Ok(entry.path());
    }
  }
  Ok(dir.to_path_buf())
}
