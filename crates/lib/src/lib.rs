//! stackwright-lib: dependency-ordered builds of multi-component stacks
//!
//! This crate provides the orchestration core used to assemble a full stack
//! into a single shared install root:
//! - `Component`: immutable description of one buildable unit and its fingerprint
//! - `Registry`: the declared components of a project and their build order
//! - `SourceFetcher`: source acquisition with checksum verification and retry
//! - `IncrementalCache`: install-root snapshots keyed by chained fingerprints
//! - `ConcurrencyPool`: fixed-size worker pool for fan-out work
//! - `Orchestrator`: drives the per-component build state machine

pub mod build;
pub mod cache;
pub mod component;
pub mod config;
pub mod consts;
pub mod fetch;
pub mod manifest;
pub mod orchestrate;
pub mod placeholder;
pub mod platform;
pub mod pool;
pub mod project;
pub mod registry;
pub mod util;
