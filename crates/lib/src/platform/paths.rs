use std::path::{Component, Path, PathBuf};

use crate::consts::APP_NAME;

/// Returns the user's home directory
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  std::env::var("USERPROFILE")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the user's home directory
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  std::env::var("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the directory for data files for the application
#[cfg(windows)]
pub fn data_dir() -> PathBuf {
  std::env::var("APPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir())
    .join(APP_NAME)
}

/// Returns the directory for data files for the application
#[cfg(not(windows))]
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// Returns the directory for cache files for the application
#[cfg(windows)]
pub fn cache_dir() -> PathBuf {
  std::env::var("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir())
    .join(APP_NAME)
    .join("Cache")
}

/// Returns the directory for cache files for the application
#[cfg(not(windows))]
pub fn cache_dir() -> PathBuf {
  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".cache"));
  cache_home.join(APP_NAME)
}

/// Expand a leading `~` and resolve relative paths against `base`.
///
/// The result is not required to exist.
pub fn expand_path(path_str: &str, base: &Path) -> PathBuf {
  if let Some(rest) = path_str.strip_prefix("~/") {
    home_dir().join(rest)
  } else if path_str == "~" {
    home_dir()
  } else if Path::new(path_str).is_absolute() {
    PathBuf::from(path_str)
  } else {
    base.join(path_str)
  }
}

/// Render a path in a drive-letter independent form.
///
/// `C:\opt\stack` and `D:/opt/stack` both become `/opt/stack`, and `.`
/// components are dropped, so the same install root maps to the same snapshot
/// store on every host.
pub fn portable_path(path: &Path) -> String {
  let mut parts: Vec<String> = Vec::new();
  let mut absolute = false;

  for component in path.components() {
    match component {
      Component::Prefix(_) => {}
      Component::RootDir => absolute = true,
      Component::CurDir => {}
      Component::ParentDir => parts.push("..".to_string()),
      Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
    }
  }

  let mut joined = parts.join("/");
  // Windows paths that arrive as plain strings on unix still carry the letter.
  if joined.len() >= 2 && joined.as_bytes()[1] == b':' && joined.as_bytes()[0].is_ascii_alphabetic() {
    joined = joined[2..].trim_start_matches(['/', '\\']).replace('\\', "/");
    absolute = true;
  }

  if absolute { format!("/{}", joined) } else { joined }
}
