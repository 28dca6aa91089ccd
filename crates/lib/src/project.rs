//! Projects: a named stack, its install root and its registered components.
//!
//! A project is usually loaded from a JSON description:
//!
//! ```json
//! {
//!   "name": "demo-stack",
//!   "install_dir": "/opt/demo",
//!   "build_version": "1.2.0",
//!   "overrides": { "zlib": "1.3.1" },
//!   "components": [
//!     { "name": "zlib", "version": "1.3", "source": { "url": "...", "checksum": "..." } },
//!     { "name": "patches", "source": { "path": "./patches" } }
//!   ]
//! }
//! ```
//!
//! Relative local source paths and a relative `install_dir` resolve against
//! the canonical directory containing the description; `~` expands to the
//! home directory.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::component::{Component, ComponentDescription, DefinitionError, VersionDescription, evaluate};
use crate::platform::paths::expand_path;
use crate::registry::Registry;

#[derive(Debug, Error)]
pub enum ProjectError {
  #[error("failed to read project description '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse project description '{path}': {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("version override for '{0}', which is not a component of this project")]
  UnknownOverride(String),

  #[error(transparent)]
  Definition(#[from] DefinitionError),
}

/// A project as written by users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectDescription {
  pub name: String,
  pub install_dir: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub build_version: Option<String>,
  /// Component name to literal version, replacing the declared version.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub overrides: BTreeMap<String, String>,
  #[serde(default)]
  pub components: Vec<ComponentDescription>,
}

#[derive(Debug)]
pub struct Project {
  name: String,
  install_root: PathBuf,
  build_version: Option<String>,
  registry: Registry,
}

impl Project {
  pub fn new(name: &str, install_root: &Path) -> Self {
    Self {
      name: name.to_string(),
      install_root: install_root.to_path_buf(),
      build_version: None,
      registry: Registry::new(),
    }
  }

  pub fn with_build_version(mut self, version: &str) -> Self {
    self.build_version = Some(version.to_string());
    self
  }

  /// Load and evaluate a project description file.
  pub fn load(path: &Path) -> Result<Self, ProjectError> {
    let content = fs::read_to_string(path).map_err(|source| ProjectError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let description: ProjectDescription = serde_json::from_str(&content).map_err(|source| ProjectError::Parse {
      path: path.to_path_buf(),
      source,
    })?;

    let parent = path
      .parent()
      .filter(|parent| !parent.as_os_str().is_empty())
      .unwrap_or(Path::new("."));
    let base = dunce::canonicalize(parent).map_err(|source| ProjectError::Read {
      path: parent.to_path_buf(),
      source,
    })?;
    let project = Self::from_description(description, &base)?;
    info!(
      project = %project.name,
      components = project.registry.len(),
      path = %path.display(),
      "loaded project"
    );
    Ok(project)
  }

  /// Evaluate a description, resolving relative paths against `base`.
  pub fn from_description(description: ProjectDescription, base: &Path) -> Result<Self, ProjectError> {
    let ProjectDescription {
      name,
      install_dir,
      build_version,
      overrides,
      components,
    } = description;

    let mut project = Self::new(&name, &expand_path(&install_dir, base));
    project.build_version = build_version;

    // Every registration under an overridden name gets the override, so it
    // also holds for the definition that ends up active.
    let mut applied = BTreeSet::new();
    for mut component in components {
      if let Some(version) = overrides.get(&component.name) {
        debug!(component = %component.name, %version, "applying version override");
        component.version = Some(VersionDescription::Literal(version.clone()));
        applied.insert(component.name.clone());
      }
      if let Some(path) = component.source.path.take() {
        component.source.path = Some(expand_path(&path.to_string_lossy(), base));
      }
      project.register(Arc::new(evaluate(component)?));
    }

    if let Some(unknown) = overrides.into_keys().find(|name| !applied.contains(name)) {
      return Err(ProjectError::UnknownOverride(unknown));
    }

    Ok(project)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn install_root(&self) -> &Path {
    &self.install_root
  }

  pub fn build_version(&self) -> Option<&str> {
    self.build_version.as_deref()
  }

  /// Register a component; see [`Registry::register`].
  pub fn register(&mut self, component: Arc<Component>) -> bool {
    self.registry.register(component)
  }

  pub fn registry(&self) -> &Registry {
    &self.registry
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::component::SourceDescriptor;
  use serial_test::serial;
  use tempfile::TempDir;

  const CHECKSUM: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

  fn write_project(dir: &Path, json: &str) -> PathBuf {
    let path = dir.join("project.json");
    fs::write(&path, json).unwrap();
    path
  }

  #[test]
  fn load_registers_components_in_order() {
    let temp = TempDir::new().unwrap();
    let path = write_project(
      temp.path(),
      &format!(
        r#"{{
          "name": "demo",
          "install_dir": "/opt/demo",
          "build_version": "1.2.0",
          "components": [
            {{ "name": "ruby", "version": "3.3.1", "dependencies": ["zlib"], "source": {{ "path": "/src/ruby" }} }},
            {{ "name": "zlib", "version": "1.3.1", "source": {{ "url": "https://zlib.net/zlib.tgz", "checksum": "{}" }} }}
          ]
        }}"#,
        CHECKSUM
      ),
    );

    let project = Project::load(&path).unwrap();
    assert_eq!(project.name(), "demo");
    assert_eq!(project.install_root(), Path::new("/opt/demo"));
    assert_eq!(project.build_version(), Some("1.2.0"));

    let names: Vec<_> = project.registry().components().map(|c| c.name().to_string()).collect();
    assert_eq!(names, ["ruby", "zlib"]);
  }

  #[test]
  fn relative_paths_resolve_against_description() {
    let temp = TempDir::new().unwrap();
    let path = write_project(
      temp.path(),
      r#"{
        "name": "demo",
        "install_dir": "out/root",
        "components": [ { "name": "patches", "source": { "path": "patches" } } ]
      }"#,
    );

    let project = Project::load(&path).unwrap();
    let base = dunce::canonicalize(temp.path()).unwrap();
    assert_eq!(project.install_root(), base.join("out/root"));
    assert_eq!(
      project.registry().get("patches").unwrap().source(),
      &SourceDescriptor::Local {
        path: base.join("patches"),
      }
    );
  }

  #[test]
  #[serial]
  #[cfg(unix)]
  fn tilde_paths_expand_to_home() {
    temp_env::with_var("HOME", Some("/home/builder"), || {
      let description = ProjectDescription {
        name: "demo".to_string(),
        install_dir: "~/stack".to_string(),
        build_version: None,
        overrides: BTreeMap::new(),
        components: vec![],
      };
      let project = Project::from_description(description, Path::new("/unused")).unwrap();
      assert_eq!(project.install_root(), Path::new("/home/builder/stack"));
    });
  }

  #[test]
  fn override_replaces_declared_version() {
    let description: ProjectDescription = serde_json::from_str(
      r#"{
        "name": "demo",
        "install_dir": "/opt/demo",
        "overrides": { "ruby": "3.2.4" },
        "components": [ { "name": "ruby", "version": "3.3.1", "source": { "path": "/src/ruby" } } ]
      }"#,
    )
    .unwrap();

    let project = Project::from_description(description, Path::new("/")).unwrap();
    assert_eq!(project.registry().get("ruby").unwrap().version().unwrap(), "3.2.4");
  }

  #[test]
  fn override_applies_to_redefined_component() {
    let description: ProjectDescription = serde_json::from_str(
      r#"{
        "name": "demo",
        "install_dir": "/opt/demo",
        "overrides": { "ruby": "3.2.4" },
        "components": [
          { "name": "ruby", "version": "3.3.1", "source": { "path": "/src/ruby" } },
          { "name": "ruby", "version": "3.4.0", "source": { "path": "/src/ruby-next" } }
        ]
      }"#,
    )
    .unwrap();

    let project = Project::from_description(description, Path::new("/")).unwrap();
    let active = project.registry().get("ruby").unwrap();
    assert_eq!(active.source(), &SourceDescriptor::Local { path: PathBuf::from("/src/ruby-next") });
    assert_eq!(active.version().unwrap(), "3.2.4");
  }

  #[test]
  fn override_for_unknown_component_is_rejected() {
    let description: ProjectDescription = serde_json::from_str(
      r#"{ "name": "demo", "install_dir": "/opt/demo", "overrides": { "perl": "5.38" } }"#,
    )
    .unwrap();
    assert!(matches!(
      Project::from_description(description, Path::new("/")),
      Err(ProjectError::UnknownOverride(name)) if name == "perl"
    ));
  }

  #[test]
  fn invalid_component_fails_the_load() {
    let temp = TempDir::new().unwrap();
    let path = write_project(
      temp.path(),
      r#"{ "name": "demo", "install_dir": "/opt", "components": [ { "name": "x", "source": {} } ] }"#,
    );
    assert!(matches!(
      Project::load(&path),
      Err(ProjectError::Definition(DefinitionError::MissingSource { .. }))
    ));
  }

  #[test]
  fn unknown_fields_are_rejected() {
    let temp = TempDir::new().unwrap();
    let path = write_project(temp.path(), r#"{ "name": "demo", "install_dir": "/opt", "packagers": [] }"#);
    assert!(matches!(Project::load(&path), Err(ProjectError::Parse { .. })));
  }
}
