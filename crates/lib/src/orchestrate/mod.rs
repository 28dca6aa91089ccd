//! Running a project: resolve, restore or fetch-build-capture, in build order.
//!
//! For every component in build order the orchestrator:
//!
//! 1. resolves its source identity (with retries) and binds a version that
//!    is declared as another component's version,
//! 2. asks the [`IncrementalCache`] to restore the install root to the state
//!    cached under the component's chained key,
//! 3. on a miss fetches the source, runs the recipe through the
//!    [`BuildExecutor`] and captures the install root.
//!
//! The first failure stops the run. Components restored or captured before
//! it keep their cache entries, so the next run resumes from there. After a
//! successful run the version manifest is written into the install root.

mod types;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::build::{BuildContext, BuildExecutor, CommandExecutor};
use crate::cache::{CacheStatus, DirSnapshotStore, IncrementalCache, SnapshotStore};
use crate::component::Component;
use crate::config::BuildConfig;
use crate::fetch::{FetchContext, FetchError, FetchResult, SourceFetcher, fetcher_for, with_retries};
use crate::manifest::VersionManifest;
use crate::pool::ConcurrencyPool;
use crate::project::Project;

pub use types::{ComponentOutcome, ComponentState, Phase, PhaseError, RunError, RunReport};

/// Drives builds of one install root.
pub struct Orchestrator<S, E> {
  config: BuildConfig,
  fetch: FetchContext,
  cache: IncrementalCache<S>,
  executor: E,
  last_run: Vec<ComponentOutcome>,
}

impl Orchestrator<DirSnapshotStore, CommandExecutor> {
  /// An orchestrator for `project` using the directory snapshot store and
  /// child-process build steps.
  pub fn for_project(config: BuildConfig, project: &Project) -> Result<Self, RunError> {
    let store = DirSnapshotStore::for_install_root(&config.snapshot_dir, project.install_root(), config.workers);
    Self::new(config, project.install_root(), store, CommandExecutor::new())
  }
}

impl<S: SnapshotStore, E: BuildExecutor> Orchestrator<S, E> {
  pub fn new(config: BuildConfig, install_root: &Path, store: S, executor: E) -> Result<Self, RunError> {
    let fetch = FetchContext::from_config(&config).map_err(RunError::Setup)?;
    Ok(Self {
      config,
      fetch,
      cache: IncrementalCache::new(store, install_root),
      executor,
      last_run: Vec::new(),
    })
  }

  pub fn config(&self) -> &BuildConfig {
    &self.config
  }

  pub fn cache(&self) -> &IncrementalCache<S> {
    &self.cache
  }

  pub fn executor(&self) -> &E {
    &self.executor
  }

  /// Outcomes of the most recent run, including a failed one. The failing
  /// component is the last entry and is in [`ComponentState::Failed`].
  pub fn last_run(&self) -> &[ComponentOutcome] {
    &self.last_run
  }

  /// Build `project` into its install root.
  ///
  /// # Errors
  ///
  /// - [`RunError::InstallRootMismatch`] if the project installs elsewhere
  ///   than this orchestrator's cache
  /// - [`RunError::Registry`] if no build order exists; nothing is touched
  /// - [`RunError::Component`] for the first component that fails
  /// - [`RunError::Manifest`] if the version manifest cannot be written
  pub fn run(&mut self, project: &Project) -> Result<RunReport, RunError> {
    self.check_install_root(project)?;
    self.last_run.clear();

    let order = project.registry().build_order()?;
    info!(
      project = %project.name(),
      components = order.len(),
      install_root = %self.cache.install_root().display(),
      "starting build"
    );

    for index in 0..order.len() {
      let mut outcome = ComponentOutcome::pending(order[index].name());
      let result = self.process(&order, index, &mut outcome);
      if let Err(e) = result {
        error!(component = %outcome.name, state = %outcome.state, error = %e, "component failed");
        outcome.advance(ComponentState::Failed);
        self.last_run.push(outcome);
        return Err(e);
      }
      self.last_run.push(outcome);
    }

    let manifest = VersionManifest::from_components(project.name(), project.build_version(), &order)?
      .write(self.cache.install_root())?;

    let report = RunReport {
      outcomes: self.last_run.clone(),
      manifest,
    };
    info!(
      project = %project.name(),
      built = report.built().len(),
      restored = report.restored().len(),
      "build finished"
    );
    Ok(report)
  }

  /// Acquire the sources of every component of `project` concurrently.
  ///
  /// Each fetch records the resolved source identity on its component, so a
  /// following [`run`](Self::run) does not resolve again. Returns how many
  /// sources were acquired; on failure the first error in build order is
  /// returned after every fetch has finished.
  pub fn prefetch(&self, project: &Project) -> Result<usize, RunError> {
    let order = project.registry().build_order()?;
    let slots: Arc<Mutex<Vec<Option<Result<FetchResult, FetchError>>>>> =
      Arc::new(Mutex::new((0..order.len()).map(|_| None).collect()));

    let pool = ConcurrencyPool::new(self.config.workers).map_err(RunError::Workers)?;
    debug!(components = order.len(), workers = pool.size(), "prefetching sources");

    for (index, component) in order.iter().enumerate() {
      let component = Arc::clone(component);
      let ctx = self.fetch.clone();
      let slots = Arc::clone(&slots);
      pool.schedule(move || {
        let result = fetcher_for(&component, &ctx).fetch();
        slots.lock()[index] = Some(result);
      });
    }
    pool.shutdown();

    let mut results = slots.lock();
    let mut fetched = 0;
    for (component, slot) in order.iter().zip(results.iter_mut()) {
      let result = slot.take().ok_or_else(|| {
        RunError::component(
          component.name(),
          Phase::Fetch,
          FetchError::NotFetched {
            component: component.name().to_string(),
          },
        )
      })?;
      let result = result.map_err(|e| RunError::component(component.name(), Phase::Fetch, e))?;
      component
        .record_resolution(&result.version)
        .map_err(|e| RunError::component(component.name(), Phase::Resolve, e))?;
      fetched += 1;
    }

    info!(project = %project.name(), fetched, "prefetched sources");
    Ok(fetched)
  }

  fn check_install_root(&self, project: &Project) -> Result<(), RunError> {
    if project.install_root() != self.cache.install_root() {
      return Err(RunError::InstallRootMismatch {
        project: project.install_root().to_path_buf(),
        cache: self.cache.install_root().to_path_buf(),
      });
    }
    Ok(())
  }

  fn process(&mut self, order: &[Arc<Component>], index: usize, outcome: &mut ComponentOutcome) -> Result<(), RunError> {
    let component = &order[index];
    let preceding = &order[..index];
    let name = component.name();
    let fetcher = fetcher_for(component, &self.fetch);

    resolve(component, preceding, fetcher.as_ref()).map_err(|e| RunError::component(name, Phase::Resolve, e))?;
    let version = component
      .version()
      .map_err(|e| RunError::component(name, Phase::Resolve, e))?
      .to_string();
    outcome.version = Some(version.clone());
    outcome.key =
      Some(IncrementalCache::<S>::key_for(component, preceding).map_err(|e| RunError::component(name, Phase::Cache, e))?);

    let status = self
      .cache
      .restore(component, preceding)
      .map_err(|e| RunError::component(name, Phase::Cache, e))?;
    if status == CacheStatus::Hit {
      outcome.advance(ComponentState::Restored);
      outcome.advance(ComponentState::Skipped);
      info!(component = %name, %version, "restored from cache, skipping build");
      return Ok(());
    }
    outcome.advance(ComponentState::Miss);

    if index == 0 {
      self.cache.reset().map_err(|e| RunError::component(name, Phase::Cache, e))?;
    }

    outcome.advance(ComponentState::Fetching);
    let fetched = fetcher.fetch().map_err(|e| RunError::component(name, Phase::Fetch, e))?;
    if let Some(expected) = component.resolution()
      && fetched.version != expected
    {
      // The source moved since it was resolved; building it would store
      // content under a key that does not describe it.
      return Err(RunError::component(
        name,
        Phase::Fetch,
        FetchError::ChecksumMismatch {
          component: name.to_string(),
          expected: expected.to_string(),
          actual: fetched.version,
        },
      ));
    }
    debug!(component = %name, path = %fetched.path.display(), verified = fetched.verified, "source ready");

    outcome.advance(ComponentState::Building);
    let ctx = BuildContext::new(
      name,
      &version,
      self.cache.install_root(),
      &fetched.path,
      &self.config.build_dir.join(name),
    );
    self
      .executor
      .execute(component, &ctx)
      .map_err(|e| RunError::component(name, Phase::Build, e))?;

    let commit = self
      .cache
      .capture(component, preceding)
      .map_err(|e| RunError::component(name, Phase::Cache, e))?;
    outcome.advance(ComponentState::Captured);
    info!(component = %name, %version, ?commit, "built and captured");
    Ok(())
  }
}

/// Record the source identity of `component` and bind a version taken from
/// an earlier component.
fn resolve(component: &Component, preceding: &[Arc<Component>], fetcher: &dyn SourceFetcher) -> Result<(), PhaseError> {
  if component.resolution().is_none() {
    let identity = with_retries(component.name(), fetcher.retries(), || fetcher.resolve_version())?;
    component.record_resolution(&identity)?;
    debug!(component = %component.name(), %identity, "resolved source");
  }

  if let Some(bound) = component.version_binding()
    && !component.is_version_resolved()
  {
    // Bindings are dependency edges, so the bound component is earlier in
    // build order and already resolved.
    let source = preceding.iter().rev().find(|earlier| earlier.name() == bound);
    if let Some(source) = source {
      component.bind_version(source.version()?)?;
    }
  }
  Ok(())
}
