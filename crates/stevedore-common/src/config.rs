//! Global configuration model for a Stevedore run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{CancellationPolicy, ResolutionPolicy};

/// Root configuration for one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StevedoreConfig {
    /// Directory compose files are discovered from and resolved against.
    pub working_dir: PathBuf,
    /// Explicit compose files; empty means discovery.
    pub compose_files: Vec<PathBuf>,
    /// Explicit project name; `None` derives it from the project.
    pub project_name: Option<String>,
    /// Docker executable used by the default backend.
    pub docker_binary: String,
    /// How shared dependencies are materialized.
    pub resolution: ResolutionPolicy,
    /// How a failing task affects its siblings.
    pub cancellation: CancellationPolicy,
    /// Seconds a container is given to stop before it is killed.
    pub stop_grace_secs: u32,
}

impl Default for StevedoreConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("."),
            compose_files: Vec::new(),
            project_name: None,
            docker_binary: crate::constants::DEFAULT_DOCKER_BINARY.to_string(),
            resolution: ResolutionPolicy::default(),
            cancellation: CancellationPolicy::default(),
            stop_grace_secs: crate::constants::DEFAULT_STOP_GRACE_SECS,
        }
    }
}
