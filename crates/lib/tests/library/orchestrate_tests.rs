//! End-to-end runs: directory snapshot store, child-process build steps,
//! local and HTTP sources.

#![cfg(unix)]

use std::fs;

use serde_json::json;
use stackwright_lib::build::BuildStepError;
use stackwright_lib::manifest::VersionManifest;
use stackwright_lib::orchestrate::{ComponentState, Orchestrator, Phase, PhaseError, RunError};

use super::common::{Workspace, tarball};

fn local(ws: &Workspace, name: &str, deps: &[&str]) -> serde_json::Value {
  json!({
    "name": name,
    "version": "1.0",
    "dependencies": deps,
    "source": { "path": ws.path().join("local").join(name) },
    "build": [ws.copy_step()],
  })
}

mod incremental {
  use super::*;

  #[test]
  fn unchanged_components_are_restored_not_rebuilt() {
    let ws = Workspace::new();
    ws.write_source("d", "lib.txt", "d v1");
    ws.write_source("c", "app.txt", "c v1");
    let components = || json!([local(&ws, "c", &["d"]), local(&ws, "d", &[])]);

    let project = ws.project(components());
    let report = Orchestrator::for_project(ws.config(), &project)
      .unwrap()
      .run(&project)
      .unwrap();
    assert_eq!(report.built(), ["d", "c"]);
    assert_eq!(ws.build_log(), ["d", "c"]);
    assert_eq!(fs::read_to_string(ws.install_root().join("d/lib.txt")).unwrap(), "d v1");
    assert_eq!(fs::read_to_string(ws.install_root().join("c/app.txt")).unwrap(), "c v1");

    let project = ws.project(components());
    let report = Orchestrator::for_project(ws.config(), &project)
      .unwrap()
      .run(&project)
      .unwrap();
    assert_eq!(report.restored(), ["d", "c"]);
    assert!(report.built().is_empty());
    assert_eq!(ws.build_log(), ["d", "c"]);
    assert!(ws.install_root().join("c/app.txt").exists());
  }

  #[test]
  fn downstream_change_rebuilds_only_downstream() {
    let ws = Workspace::new();
    ws.write_source("d", "lib.txt", "d v1");
    ws.write_source("c", "app.txt", "c v1");
    let components = || json!([local(&ws, "c", &["d"]), local(&ws, "d", &[])]);

    let project = ws.project(components());
    Orchestrator::for_project(ws.config(), &project)
      .unwrap()
      .run(&project)
      .unwrap();

    ws.write_source("c", "app.txt", "c v2");
    let project = ws.project(components());
    let report = Orchestrator::for_project(ws.config(), &project)
      .unwrap()
      .run(&project)
      .unwrap();

    assert_eq!(report.restored(), ["d"]);
    assert_eq!(report.built(), ["c"]);
    assert_eq!(ws.build_log(), ["d", "c", "c"]);
    assert_eq!(fs::read_to_string(ws.install_root().join("c/app.txt")).unwrap(), "c v2");
  }

  #[test]
  fn upstream_change_rebuilds_everything_after_it() {
    let ws = Workspace::new();
    ws.write_source("d", "lib.txt", "d v1");
    ws.write_source("c", "app.txt", "c v1");
    let components = || json!([local(&ws, "c", &["d"]), local(&ws, "d", &[])]);

    let project = ws.project(components());
    let first = Orchestrator::for_project(ws.config(), &project)
      .unwrap()
      .run(&project)
      .unwrap();

    ws.write_source("d", "lib.txt", "d v2");
    let project = ws.project(components());
    let second = Orchestrator::for_project(ws.config(), &project)
      .unwrap()
      .run(&project)
      .unwrap();

    assert_eq!(second.built(), ["d", "c"]);
    assert_ne!(first.outcome("c").unwrap().key, second.outcome("c").unwrap().key);
    assert_eq!(fs::read_to_string(ws.install_root().join("d/lib.txt")).unwrap(), "d v2");
  }

  #[test]
  fn build_output_in_the_source_tree_does_not_invalidate_the_cache() {
    let ws = Workspace::new();
    ws.write_source("zlib", "zlib.c", "int z;");
    let mut zlib = local(&ws, "zlib", &[]);
    zlib["build"] = json!([
      { "command": "/bin/sh", "args": ["-c", "echo compiled > zlib.o"] },
      ws.copy_step(),
    ]);

    for _ in 0..2 {
      let project = ws.project(json!([zlib.clone()]));
      Orchestrator::for_project(ws.config(), &project)
        .unwrap()
        .run(&project)
        .unwrap();
    }

    assert_eq!(ws.build_log(), ["zlib"]);
    assert!(!ws.path().join("local/zlib/zlib.o").exists());
    assert_eq!(
      fs::read_to_string(ws.install_root().join("zlib/zlib.o")).unwrap(),
      "compiled\n"
    );
  }

  #[test]
  fn manifest_lists_every_component() {
    let ws = Workspace::new();
    ws.write_source("d", "lib.txt", "d");
    ws.write_source("c", "app.txt", "c");

    let project = ws.project(json!([local(&ws, "c", &["d"]), local(&ws, "d", &[])]));
    let report = Orchestrator::for_project(ws.config(), &project)
      .unwrap()
      .run(&project)
      .unwrap();

    let manifest = VersionManifest::load(&ws.install_root()).unwrap().unwrap();
    assert_eq!(report.manifest, VersionManifest::path_in(&ws.install_root()));
    assert_eq!(manifest.project, "demo-stack");
    assert_eq!(manifest.build_version.as_deref(), Some("1.0.0"));
    assert_eq!(manifest.software.keys().collect::<Vec<_>>(), ["c", "d"]);
    assert_eq!(manifest.software["d"].source.kind, "local");
  }
}

mod failures {
  use super::*;

  #[test]
  fn failed_step_halts_the_run_and_keeps_earlier_captures() {
    let ws = Workspace::new();
    ws.write_source("d", "lib.txt", "d");
    ws.write_source("c", "app.txt", "c");

    let mut broken = local(&ws, "c", &["d"]);
    broken["build"] = json!([{ "command": "/bin/sh", "args": ["-c", "exit 7"] }]);
    let project = ws.project(json!([broken, local(&ws, "d", &[])]));

    let mut orchestrator = Orchestrator::for_project(ws.config(), &project).unwrap();
    let err = orchestrator.run(&project).unwrap_err();
    assert_eq!(err.failed_at(), Some(("c", Phase::Build)));
    assert!(matches!(
      err,
      RunError::Component {
        source: PhaseError::Build(BuildStepError::Failed {
          index: 0,
          code: Some(7),
          ..
        }),
        ..
      }
    ));
    let states: Vec<_> = orchestrator.last_run().iter().map(|o| o.state).collect();
    assert_eq!(states, [ComponentState::Captured, ComponentState::Failed]);

    // Fixing the recipe resumes from the captured dependency.
    let project = ws.project(json!([local(&ws, "c", &["d"]), local(&ws, "d", &[])]));
    let report = Orchestrator::for_project(ws.config(), &project)
      .unwrap()
      .run(&project)
      .unwrap();
    assert_eq!(report.restored(), ["d"]);
    assert_eq!(report.built(), ["c"]);
    assert_eq!(ws.build_log(), ["d", "c"]);
  }

  #[test]
  fn unknown_dependency_touches_nothing() {
    let ws = Workspace::new();
    ws.write_source("c", "app.txt", "c");
    let project = ws.project(json!([local(&ws, "c", &["missing"])]));

    let mut orchestrator = Orchestrator::for_project(ws.config(), &project).unwrap();
    assert!(matches!(orchestrator.run(&project), Err(RunError::Registry(_))));
    assert!(ws.build_log().is_empty());
    assert!(!ws.install_root().exists());
  }
}

mod network {
  use super::*;

  fn network(name: &str, url: &str, checksum: &str, ws: &Workspace) -> serde_json::Value {
    json!({
      "name": name,
      "version": "1.3",
      "source": { "url": url, "checksum": checksum },
      "build": [ws.copy_step()],
    })
  }

  #[test]
  fn upstream_checksum_change_rebuilds_downstream() {
    let mut server = mockito::Server::new();
    let ws = Workspace::new();
    ws.write_source("app", "main.c", "int main() {}");

    let (v1, sum1) = tarball("zlib-1.3", &[("zlib.h", "v1")]);
    let (v2, sum2) = tarball("zlib-1.3", &[("zlib.h", "v2")]);
    let first_mock = server.mock("GET", "/zlib-1.3.tar.gz").with_body(v1).expect(1).create();
    let second_mock = server.mock("GET", "/zlib-1.3-r2.tar.gz").with_body(v2).expect(1).create();

    let build = |path: &str, checksum: &str| {
      let project = ws.project(json!([
        local(&ws, "app", &["zlib"]),
        network("zlib", &format!("{}{}", server.url(), path), checksum, &ws),
      ]));
      Orchestrator::for_project(ws.config(), &project)
        .unwrap()
        .run(&project)
        .unwrap()
    };

    let first = build("/zlib-1.3.tar.gz", &sum1);
    assert_eq!(first.built(), ["zlib", "app"]);
    assert_eq!(fs::read_to_string(ws.install_root().join("zlib/zlib.h")).unwrap(), "v1");

    let again = build("/zlib-1.3.tar.gz", &sum1);
    assert_eq!(again.restored(), ["zlib", "app"]);

    let second = build("/zlib-1.3-r2.tar.gz", &sum2);
    assert_eq!(second.built(), ["zlib", "app"]);
    assert_eq!(fs::read_to_string(ws.install_root().join("zlib/zlib.h")).unwrap(), "v2");

    first_mock.assert();
    second_mock.assert();
  }

  #[test]
  fn tampered_archive_fails_the_fetch_phase() {
    let mut server = mockito::Server::new();
    let ws = Workspace::new();

    let (_, declared) = tarball("zlib-1.3", &[("zlib.h", "expected")]);
    let (served, _) = tarball("zlib-1.3", &[("zlib.h", "tampered")]);
    let mock = server.mock("GET", "/zlib-1.3.tar.gz").with_body(served).expect(1).create();

    let url = format!("{}/zlib-1.3.tar.gz", server.url());
    let project = ws.project(json!([network("zlib", &url, &declared, &ws)]));
    let err = Orchestrator::for_project(ws.config(), &project)
      .unwrap()
      .run(&project)
      .unwrap_err();

    assert_eq!(err.failed_at(), Some(("zlib", Phase::Fetch)));
    assert!(matches!(
      err,
      RunError::Component {
        source: PhaseError::Fetch(ref fetch),
        ..
      } if fetch.is_integrity()
    ));
    assert!(ws.build_log().is_empty());
    mock.assert();
  }

  #[test]
  fn prefetched_sources_are_not_downloaded_again() {
    let mut server = mockito::Server::new();
    let ws = Workspace::new();
    ws.write_source("app", "main.c", "int main() {}");

    let (body, checksum) = tarball("zlib-1.3", &[("zlib.h", "v1")]);
    let mock = server.mock("GET", "/zlib-1.3.tar.gz").with_body(body).expect(1).create();

    let url = format!("{}/zlib-1.3.tar.gz", server.url());
    let project = ws.project(json!([local(&ws, "app", &["zlib"]), network("zlib", &url, &checksum, &ws)]));
    let mut orchestrator = Orchestrator::for_project(ws.config(), &project).unwrap();

    assert_eq!(orchestrator.prefetch(&project).unwrap(), 2);
    let report = orchestrator.run(&project).unwrap();
    assert_eq!(report.built(), ["zlib", "app"]);
    mock.assert();
  }
}
