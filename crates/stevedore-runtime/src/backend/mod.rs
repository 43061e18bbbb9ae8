//! Execution backend abstraction.
//!
//! The backend is the only mutable shared resource of a run. Construction
//! calls (`host_directory`, `cache_volume`) are synchronous and run during
//! resolution; `run` and `bind_socket` are the two suspension points the
//! orchestrator awaits. Both take a cancellation token and must return
//! promptly once it fires.

pub mod docker;
pub mod proxy;

use std::path::Path;

use async_trait::async_trait;
use stevedore_common::error::Result;
use tokio_util::sync::CancellationToken;

use crate::publish::PublishedEndpoint;
use crate::unit::{CacheVolume, ExecutionUnit, HostDirectory};

/// How a running unit or endpoint stopped without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitExit {
    /// The unit ran to completion with a zero status.
    Completed,
    /// The cancellation token fired before completion.
    Cancelled,
}

/// Platform-agnostic execution backend.
///
/// Implementors must be safe to call concurrently from many tasks; any
/// serialization a backend needs is its own responsibility.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Returns a fresh, empty unit for the named pipeline.
    fn container(&self, pipeline: &str) -> ExecutionUnit {
        ExecutionUnit::new(pipeline)
    }

    /// Resolves a host directory for mounting or building.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot access the directory.
    fn host_directory(&self, path: &Path) -> Result<HostDirectory>;

    /// Resolves a named volume scoped to this backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is not acceptable to the backend.
    fn cache_volume(&self, name: &str) -> Result<CacheVolume>;

    /// Starts `unit` and waits until it exits or `cancel` fires.
    ///
    /// Services bound into `unit` are started first.
    ///
    /// # Errors
    ///
    /// Returns an error if the unit cannot be started or exits abnormally.
    async fn run(&self, unit: &ExecutionUnit, cancel: CancellationToken) -> Result<UnitExit>;

    /// Binds `endpoint` on the host and serves it against `unit` until
    /// `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the unit's
    /// address cannot be determined.
    async fn bind_socket(
        &self,
        unit: &ExecutionUnit,
        endpoint: &PublishedEndpoint,
        cancel: CancellationToken,
    ) -> Result<UnitExit>;

    /// Returns whether this backend is operational on the current host.
    fn is_available(&self) -> bool;
}
