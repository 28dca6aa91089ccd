//! Shared fixtures for the library integration tests.

use std::fs;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use stackwright_lib::config::BuildConfig;
use stackwright_lib::project::Project;
use tempfile::TempDir;

/// A scratch area holding local sources, the install root, a build log, and
/// every orchestrator directory.
pub struct Workspace {
  temp: TempDir,
}

impl Workspace {
  pub fn new() -> Self {
    Self {
      temp: TempDir::new().unwrap(),
    }
  }

  pub fn path(&self) -> &Path {
    self.temp.path()
  }

  pub fn install_root(&self) -> PathBuf {
    self.path().join("opt/stack")
  }

  pub fn config(&self) -> BuildConfig {
    BuildConfig::rooted_at(&self.path().join("work"))
      .with_workers(2)
      .with_fetch_retries(1)
  }

  /// Write (or overwrite) a file of a local source tree.
  pub fn write_source(&self, component: &str, file: &str, content: &str) -> PathBuf {
    let dir = self.path().join("local").join(component);
    let path = dir.join(file);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    dir
  }

  /// Components built so far, in build order, across all runs.
  pub fn build_log(&self) -> Vec<String> {
    fs::read_to_string(self.path().join("builds.log"))
      .map(|log| log.lines().map(str::to_string).collect())
      .unwrap_or_default()
  }

  /// A build step that appends the component name to the build log and
  /// copies the source tree to `{install_dir}/{name}`.
  pub fn copy_step(&self) -> serde_json::Value {
    let log = self.path().join("builds.log");
    serde_json::json!({
      "command": "/bin/sh",
      "args": [
        "-c",
        format!(
          "echo \"$STACKWRIGHT_NAME\" >> '{}' && mkdir -p \"$STACKWRIGHT_INSTALL_DIR/$STACKWRIGHT_NAME\" && cp -R . \"$STACKWRIGHT_INSTALL_DIR/$STACKWRIGHT_NAME/\"",
          log.display()
        )
      ]
    })
  }

  /// Write a project description and load it.
  pub fn project(&self, components: serde_json::Value) -> Project {
    let description = serde_json::json!({
      "name": "demo-stack",
      "install_dir": self.install_root(),
      "build_version": "1.0.0",
      "components": components,
    });
    let path = self.path().join("project.json");
    fs::write(&path, serde_json::to_string_pretty(&description).unwrap()).unwrap();
    Project::load(&path).unwrap()
  }
}

/// A gzipped tarball with one top-level directory, and its SHA-256.
pub fn tarball(root: &str, files: &[(&str, &str)]) -> (Vec<u8>, String) {
  let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
  for (name, content) in files {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
      .append_data(&mut header, format!("{}/{}", root, name), content.as_bytes())
      .unwrap();
  }
  let bytes = builder.into_inner().unwrap().finish().unwrap();
  let checksum = hex::encode(Sha256::digest(&bytes));
  (bytes, checksum)
}
