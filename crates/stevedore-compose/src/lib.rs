//! # stevedore-compose
//!
//! Loads compose projects into the service descriptor model consumed by
//! the Stevedore runtime.
//!
//! Handles:
//! - **Model**: Read-only service descriptors keyed by service name.
//! - **Loader**: Compose file discovery, variable interpolation, merging of
//!   multiple files, and normalisation of short and long syntax.
//! - **Graph**: `depends_on` graph construction and launch ordering.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod graph;
pub mod loader;
pub mod model;

pub use loader::{ComposeLoader, LoaderOptions, ProjectLoader};
pub use model::{BuildSpec, PortConfig, Project, ServiceDescriptor, VolumeMount, VolumeType};
