//! Types for orchestrated runs: component states, phases, reports and errors.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::build::BuildStepError;
use crate::cache::{CacheError, CacheKey};
use crate::component::VersionError;
use crate::fetch::FetchError;
use crate::manifest::ManifestError;
use crate::registry::RegistryError;

/// Where a component is in its per-run lifecycle.
///
/// ```text
/// Pending -> Restored -> Skipped
/// Pending -> Miss -> Fetching -> Building -> Captured
/// any     -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentState {
  Pending,
  Restored,
  Skipped,
  Miss,
  Fetching,
  Building,
  Captured,
  Failed,
}

impl ComponentState {
  /// Whether the component finished successfully in this run.
  pub fn is_success(&self) -> bool {
    matches!(self, ComponentState::Skipped | ComponentState::Captured)
  }

  /// Whether the state allows no further transition.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      ComponentState::Skipped | ComponentState::Captured | ComponentState::Failed
    )
  }

  /// Whether moving to `next` is a legal transition.
  pub fn can_advance_to(&self, next: ComponentState) -> bool {
    use ComponentState::*;
    match (self, next) {
      (Failed, _) | (Skipped, _) | (Captured, _) => false,
      (_, Failed) => true,
      (Pending, Restored) | (Pending, Miss) => true,
      (Restored, Skipped) => true,
      (Miss, Fetching) | (Fetching, Building) | (Building, Captured) => true,
      _ => false,
    }
  }
}

impl fmt::Display for ComponentState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ComponentState::Pending => "pending",
      ComponentState::Restored => "restored",
      ComponentState::Skipped => "skipped",
      ComponentState::Miss => "miss",
      ComponentState::Fetching => "fetching",
      ComponentState::Building => "building",
      ComponentState::Captured => "captured",
      ComponentState::Failed => "failed",
    };
    f.write_str(name)
  }
}

/// The part of a component's processing an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
  /// Resolving the source identity, version or fingerprint.
  Resolve,
  /// Acquiring source.
  Fetch,
  /// Running the build recipe.
  Build,
  /// Restoring or capturing the install root.
  Cache,
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Phase::Resolve => "resolve",
      Phase::Fetch => "fetch",
      Phase::Build => "build",
      Phase::Cache => "cache",
    };
    f.write_str(name)
  }
}

/// The underlying failure of one component.
#[derive(Debug, Error)]
pub enum PhaseError {
  #[error(transparent)]
  Fetch(#[from] FetchError),

  #[error(transparent)]
  Version(#[from] VersionError),

  #[error(transparent)]
  Build(#[from] BuildStepError),

  #[error(transparent)]
  Cache(#[from] CacheError),
}

#[derive(Debug, Error)]
pub enum RunError {
  /// The build order could not be computed; nothing was touched.
  #[error(transparent)]
  Registry(#[from] RegistryError),

  /// The first component failure in build order.
  #[error("{phase} of '{component}' failed: {source}")]
  Component {
    component: String,
    phase: Phase,
    #[source]
    source: PhaseError,
  },

  #[error("the project installs into '{project}' but the cache serves '{cache}'")]
  InstallRootMismatch { project: PathBuf, cache: PathBuf },

  #[error("failed to set up source fetching: {0}")]
  Setup(#[source] FetchError),

  #[error("failed to start workers: {0}")]
  Workers(#[source] std::io::Error),

  #[error(transparent)]
  Manifest(#[from] ManifestError),
}

impl RunError {
  pub(crate) fn component(component: &str, phase: Phase, source: impl Into<PhaseError>) -> Self {
    RunError::Component {
      component: component.to_string(),
      phase,
      source: source.into(),
    }
  }

  /// The component and phase of a component failure.
  pub fn failed_at(&self) -> Option<(&str, Phase)> {
    match self {
      RunError::Component { component, phase, .. } => Some((component, *phase)),
      _ => None,
    }
  }
}

/// What happened to one component during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentOutcome {
  pub name: String,
  pub state: ComponentState,
  /// Every state the component went through, starting with `Pending`.
  pub history: Vec<ComponentState>,
  pub version: Option<String>,
  pub key: Option<CacheKey>,
}

impl ComponentOutcome {
  pub(crate) fn pending(name: &str) -> Self {
    Self {
      name: name.to_string(),
      state: ComponentState::Pending,
      history: vec![ComponentState::Pending],
      version: None,
      key: None,
    }
  }

  pub(crate) fn advance(&mut self, next: ComponentState) {
    debug_assert!(
      self.state.can_advance_to(next),
      "illegal transition {} -> {}",
      self.state,
      next
    );
    tracing::debug!(component = %self.name, from = %self.state, to = %next, "state transition");
    self.state = next;
    self.history.push(next);
  }
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
  /// One outcome per component, in build order.
  pub outcomes: Vec<ComponentOutcome>,
  /// Where the version manifest was written.
  pub manifest: PathBuf,
}

impl RunReport {
  pub fn outcome(&self, name: &str) -> Option<&ComponentOutcome> {
    self.outcomes.iter().find(|outcome| outcome.name == name)
  }

  /// Names of the components that were built, in build order.
  pub fn built(&self) -> Vec<&str> {
    self.with_state(ComponentState::Captured)
  }

  /// Names of the components restored from cache, in build order.
  pub fn restored(&self) -> Vec<&str> {
    self.with_state(ComponentState::Skipped)
  }

  fn with_state(&self, state: ComponentState) -> Vec<&str> {
    self
      .outcomes
      .iter()
      .filter(|outcome| outcome.state == state)
      .map(|outcome| outcome.name.as_str())
      .collect()
  }
}
