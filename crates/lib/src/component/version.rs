//! Component versions and the write-once resolution protocol.

use std::sync::OnceLock;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
  /// The version is bound to something that has not been resolved yet.
  #[error("version of '{component}' is not resolved yet (waiting on {waiting_on})")]
  Unresolved { component: String, waiting_on: String },

  /// A second, different value was offered for a write-once version.
  #[error("version of '{component}' already resolved to '{existing}', refusing '{offered}'")]
  AlreadyResolved {
    component: String,
    existing: String,
    offered: String,
  },

  /// Literal versions are fixed at evaluation time.
  #[error("version of '{component}' is a literal and cannot be rebound")]
  Literal { component: String },
}

/// How a component's version is determined.
#[derive(Debug)]
pub enum Version {
  /// Declared in the description (possibly via a project override).
  Literal(String),
  /// Takes whatever version the named component resolved to.
  From { component: String, cell: OnceLock<String> },
  /// Not declared; takes the identity the component's own fetcher resolves
  /// (commit id, archive checksum, or directory digest).
  Fetched { cell: OnceLock<String> },
}

impl Version {
  pub fn literal(value: &str) -> Self {
    Version::Literal(value.to_string())
  }

  pub fn from_component(component: &str) -> Self {
    Version::From {
      component: component.to_string(),
      cell: OnceLock::new(),
    }
  }

  pub fn fetched() -> Self {
    Version::Fetched { cell: OnceLock::new() }
  }

  /// The component this version is bound to, if any.
  pub fn binding(&self) -> Option<&str> {
    match self {
      Version::From { component, .. } => Some(component),
      _ => None,
    }
  }

  pub fn get(&self) -> Option<&str> {
    match self {
      Version::Literal(value) => Some(value),
      Version::From { cell, .. } | Version::Fetched { cell } => cell.get().map(String::as_str),
    }
  }

  pub(crate) fn read(&self, owner: &str) -> Result<&str, VersionError> {
    self.get().ok_or_else(|| VersionError::Unresolved {
      component: owner.to_string(),
      waiting_on: match self {
        Version::From { component, .. } => format!("component '{}'", component),
        _ => "its own fetch".to_string(),
      },
    })
  }

  /// Fill a lazy version. Offering the value it already holds is a no-op.
  pub(crate) fn fill(&self, owner: &str, value: &str) -> Result<(), VersionError> {
    let cell = match self {
      Version::Literal(_) => {
        return Err(VersionError::Literal {
          component: owner.to_string(),
        });
      }
      Version::From { cell, .. } | Version::Fetched { cell } => cell,
    };

    let stored = cell.get_or_init(|| value.to_string());
    if stored != value {
      return Err(VersionError::AlreadyResolved {
        component: owner.to_string(),
        existing: stored.clone(),
        offered: value.to_string(),
      });
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn literal_is_readable_immediately() {
    let version = Version::literal("3.0.2");
    assert_eq!(version.read("openssl").unwrap(), "3.0.2");
    assert!(matches!(
      version.fill("openssl", "3.0.3"),
      Err(VersionError::Literal { .. })
    ));
  }

  #[test]
  fn bound_version_errors_until_filled() {
    let version = Version::from_component("ruby");
    assert_eq!(version.binding(), Some("ruby"));

    let err = version.read("bundler").unwrap_err();
    assert!(matches!(err, VersionError::Unresolved { .. }));
    assert!(err.to_string().contains("ruby"));

    version.fill("bundler", "3.3.1").unwrap();
    assert_eq!(version.read("bundler").unwrap(), "3.3.1");
  }

  #[test]
  fn fill_is_write_once() {
    let version = Version::fetched();
    version.fill("zlib", "abc").unwrap();
    version.fill("zlib", "abc").unwrap();

    let err = version.fill("zlib", "def").unwrap_err();
    assert_eq!(
      err,
      VersionError::AlreadyResolved {
        component: "zlib".to_string(),
        existing: "abc".to_string(),
        offered: "def".to_string(),
      }
    );
  }
}
