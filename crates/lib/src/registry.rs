//! Component registry and build ordering.
//!
//! The registry keeps every registered component in registration order and
//! computes a topological build order from the declared dependencies.
//!
//! # Duplicate names
//!
//! Registering the same `Arc<Component>` twice is a no-op. Registering a
//! different component under a name that is already taken is allowed: the
//! most recent registration becomes the active definition for that name and
//! is the one used in dependency resolution and in the build order. The name
//! keeps the position of its first registration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::component::Component;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
  /// A dependency name that no registered component answers to.
  #[error("component '{component}' depends on '{dependency}', which is not registered")]
  Configuration { component: String, dependency: String },

  /// Dependency resolution came back to a component still being resolved.
  #[error("dependency cycle detected: {}", cycle.join(" -> "))]
  CyclicDependency { cycle: Vec<String> },
}

#[derive(Debug, Default)]
pub struct Registry {
  registrations: Vec<Arc<Component>>,
  names: Vec<String>,
  active: HashMap<String, Arc<Component>>,
}

struct Visit {
  visited: HashSet<String>,
  path: Vec<String>,
  order: Vec<Arc<Component>>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a component.
  ///
  /// Returns `false` when this exact instance was already registered.
  pub fn register(&mut self, component: Arc<Component>) -> bool {
    if self.registrations.iter().any(|existing| Arc::ptr_eq(existing, &component)) {
      return false;
    }

    let name = component.name().to_string();
    if !self.active.contains_key(&name) {
      self.names.push(name.clone());
    } else {
      debug!(component = %name, "replacing active definition");
    }

    self.active.insert(name, Arc::clone(&component));
    self.registrations.push(component);
    true
  }

  /// The active definition for `name`.
  pub fn get(&self, name: &str) -> Option<&Arc<Component>> {
    self.active.get(name)
  }

  /// Number of distinct component names.
  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  /// Active definitions in registration order.
  pub fn components(&self) -> impl Iterator<Item = &Arc<Component>> {
    self.names.iter().filter_map(|name| self.active.get(name))
  }

  /// Compute the build order.
  ///
  /// Components are visited in registration order. Each component's
  /// dependencies, followed by the component its version is bound to, are
  /// emitted before the component itself. The result is deterministic for a
  /// fixed registration order.
  ///
  /// # Errors
  ///
  /// - [`RegistryError::Configuration`] for an unknown dependency name
  /// - [`RegistryError::CyclicDependency`] when a component depends on itself,
  ///   directly or transitively
  pub fn build_order(&self) -> Result<Vec<Arc<Component>>, RegistryError> {
    let mut visit = Visit {
      visited: HashSet::new(),
      path: Vec::new(),
      order: Vec::with_capacity(self.names.len()),
    };

    for component in self.components() {
      self.visit(component, &mut visit)?;
    }

    Ok(visit.order)
  }

  fn visit(&self, component: &Arc<Component>, visit: &mut Visit) -> Result<(), RegistryError> {
    let name = component.name();
    if visit.visited.contains(name) {
      return Ok(());
    }

    if let Some(start) = visit.path.iter().position(|entry| entry == name) {
      let mut cycle = visit.path[start..].to_vec();
      cycle.push(name.to_string());
      return Err(RegistryError::CyclicDependency { cycle });
    }

    visit.path.push(name.to_string());

    for dependency in edges(component) {
      let target = self.active.get(dependency).ok_or_else(|| RegistryError::Configuration {
        component: name.to_string(),
        dependency: dependency.to_string(),
      })?;
      self.visit(target, visit)?;
    }

    visit.path.pop();
    visit.visited.insert(name.to_string());
    visit.order.push(Arc::clone(component));
    Ok(())
  }

  /// Names of every component that transitively depends on `name`, in
  /// registration order.
  pub fn dependents_of(&self, name: &str) -> Vec<String> {
    let mut affected: HashSet<&str> = HashSet::from([name]);

    loop {
      let before = affected.len();
      for component in self.components() {
        if edges(component).any(|dep| affected.contains(dep)) {
          affected.insert(component.name());
        }
      }
      if affected.len() == before {
        break;
      }
    }

    self
      .names
      .iter()
      .filter(|candidate| candidate.as_str() != name && affected.contains(candidate.as_str()))
      .cloned()
      .collect()
  }
}

/// Declared dependencies plus the version binding, without duplicates.
fn edges(component: &Component) -> impl Iterator<Item = &str> {
  let binding = component
    .version_binding()
    .filter(|bound| !component.dependencies().iter().any(|dep| dep == bound));
  component.dependencies().iter().map(String::as_str).chain(binding)
}
