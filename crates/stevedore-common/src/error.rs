//! Unified error types for the Stevedore workspace.
//!
//! Configuration and resolution errors are raised before anything is
//! launched; execution errors are raised by running tasks and aggregated
//! by the orchestrator.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum StevedoreError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A service descriptor requests something that is not supported.
    #[error("invalid configuration for service \"{service}\" at {field}: {message}")]
    Config {
        /// Service whose descriptor is invalid.
        service: String,
        /// Descriptor field that carries the invalid value (e.g. `ports[0].mode`).
        field: String,
        /// Description of the problem.
        message: String,
    },

    /// A `depends_on` entry names a service absent from the project.
    #[error("service \"{service}\" depends on undefined service \"{dependency}\"")]
    UnknownService {
        /// Service declaring the dependency.
        service: String,
        /// Name that could not be found.
        dependency: String,
    },

    /// The dependency relation contains a cycle.
    #[error("cyclic dependency detected: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Services along the cycle; the first name is repeated at the end.
        cycle: Vec<String>,
    },

    /// A launched task (service run or endpoint binding) failed.
    #[error("{task} failed: {message}")]
    Execution {
        /// Task label, e.g. `service "db"` or `endpoint :8080 -> web:80/tcp`.
        task: String,
        /// Failure description.
        message: String,
    },

    /// The project loader could not produce a descriptor set.
    #[error("failed to load project from {path}: {message}")]
    Loader {
        /// Compose file or directory involved.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },

    /// The execution backend rejected a construction-time request.
    #[error("backend error during {operation}: {message}")]
    Backend {
        /// Backend operation that failed.
        operation: &'static str,
        /// Failure description.
        message: String,
    },
}

impl StevedoreError {
    /// Builds a [`StevedoreError::Config`] for `service` at `field`.
    pub fn config(
        service: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Config {
            service: service.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Builds a [`StevedoreError::Execution`] for the given task label.
    pub fn execution(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            task: task.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for errors detected before any task is launched.
    #[must_use]
    pub const fn is_pre_launch(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::UnknownService { .. }
                | Self::CyclicDependency { .. }
                | Self::Loader { .. }
        )
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StevedoreError>;
