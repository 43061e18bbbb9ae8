//! Execution units: inert, runnable representations of a service.
//!
//! A unit is an immutable value holding its pipeline name and the ordered
//! sequence of construction steps applied to it. Each `with_*` call returns
//! a new unit with one more step, so a unit can be bound into several
//! dependents while remaining shared.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use stevedore_common::types::TransportProtocol;

/// A host directory made available by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDirectory {
    path: PathBuf,
}

impl HostDirectory {
    /// Wraps a backend-resolved host path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the host path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A named volume managed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheVolume {
    name: String,
}

impl CacheVolume {
    /// Wraps a backend-scoped volume name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Returns the volume name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One construction step of an [`ExecutionUnit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOp {
    /// Use an image reference as the base.
    From {
        /// Image reference.
        image: String,
    },
    /// Build the base from a context directory.
    Build {
        /// Build context.
        context: HostDirectory,
        /// Dockerfile path relative to the context.
        dockerfile: Option<String>,
        /// Multi-stage target.
        target: Option<String>,
        /// Build arguments in application order.
        args: Vec<(String, String)>,
    },
    /// Set an environment variable.
    Env {
        /// Variable name.
        name: String,
        /// Variable value.
        value: String,
    },
    /// Declare a port as reachable by bound services.
    ExposePort {
        /// Port inside the unit.
        port: u16,
        /// Transport protocol.
        protocol: TransportProtocol,
    },
    /// Mount a host directory.
    MountDirectory {
        /// Mount point inside the unit.
        target: String,
        /// Host directory.
        source: HostDirectory,
        /// Whether the mount is read-only.
        read_only: bool,
    },
    /// Mount a named volume.
    MountCache {
        /// Mount point inside the unit.
        target: String,
        /// Volume to mount.
        volume: CacheVolume,
    },
    /// Make another unit reachable under `alias`.
    ServiceBinding {
        /// Host name the bound unit is reachable under.
        alias: String,
        /// Bound unit.
        unit: Arc<ExecutionUnit>,
    },
    /// The command the unit runs.
    Exec {
        /// Command and arguments; empty keeps the image default.
        args: Vec<String>,
        /// Whether the command runs with all root capabilities.
        insecure_root_capabilities: bool,
    },
}

/// An inert, backend-materialized runnable unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionUnit {
    pipeline: String,
    ops: Vec<UnitOp>,
}

impl ExecutionUnit {
    /// Creates an empty unit for the named pipeline.
    #[must_use]
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
            ops: Vec::new(),
        }
    }

    fn push(mut self, op: UnitOp) -> Self {
        self.ops.push(op);
        self
    }

    /// Uses `image` as the base.
    #[must_use]
    pub fn with_image(self, image: impl Into<String>) -> Self {
        self.push(UnitOp::From {
            image: image.into(),
        })
    }

    /// Builds the base from `context`.
    #[must_use]
    pub fn with_build(
        self,
        context: HostDirectory,
        dockerfile: Option<String>,
        target: Option<String>,
        args: Vec<(String, String)>,
    ) -> Self {
        self.push(UnitOp::Build {
            context,
            dockerfile,
            target,
            args,
        })
    }

    /// Sets an environment variable.
    #[must_use]
    pub fn with_env_variable(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(UnitOp::Env {
            name: name.into(),
            value: value.into(),
        })
    }

    /// Exposes `port` to bound services.
    #[must_use]
    pub fn with_exposed_port(self, port: u16, protocol: TransportProtocol) -> Self {
        self.push(UnitOp::ExposePort { port, protocol })
    }

    /// Mounts a host directory at `target`.
    #[must_use]
    pub fn with_mounted_directory(
        self,
        target: impl Into<String>,
        source: HostDirectory,
        read_only: bool,
    ) -> Self {
        self.push(UnitOp::MountDirectory {
            target: target.into(),
            source,
            read_only,
        })
    }

    /// Mounts a named volume at `target`.
    #[must_use]
    pub fn with_mounted_cache(self, target: impl Into<String>, volume: CacheVolume) -> Self {
        self.push(UnitOp::MountCache {
            target: target.into(),
            volume,
        })
    }

    /// Binds `unit` so it is reachable from this unit as `alias`.
    #[must_use]
    pub fn with_service_binding(self, alias: impl Into<String>, unit: Arc<Self>) -> Self {
        self.push(UnitOp::ServiceBinding {
            alias: alias.into(),
            unit,
        })
    }

    /// Sets the command the unit runs.
    #[must_use]
    pub fn with_exec(self, args: Vec<String>, insecure_root_capabilities: bool) -> Self {
        self.push(UnitOp::Exec {
            args,
            insecure_root_capabilities,
        })
    }

    /// Returns the pipeline (service) name.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Returns the construction sequence in application order.
    #[must_use]
    pub fn ops(&self) -> &[UnitOp] {
        &self.ops
    }

    /// Environment variables in application order.
    pub fn env(&self) -> impl Iterator<Item = (&str, &str)> {
        self.ops.iter().filter_map(|op| match op {
            UnitOp::Env { name, value } => Some((name.as_str(), value.as_str())),
            _ => None,
        })
    }

    /// Units bound into this one, with their aliases.
    pub fn service_bindings(&self) -> impl Iterator<Item = (&str, &Arc<Self>)> {
        self.ops.iter().filter_map(|op| match op {
            UnitOp::ServiceBinding { alias, unit } => Some((alias.as_str(), unit)),
            _ => None,
        })
    }

    /// The last exec step, if any.
    #[must_use]
    pub fn exec(&self) -> Option<(&[String], bool)> {
        self.ops.iter().rev().find_map(|op| match op {
            UnitOp::Exec {
                args,
                insecure_root_capabilities,
            } => Some((args.as_slice(), *insecure_root_capabilities)),
            _ => None,
        })
    }

    /// Hex SHA-256 over the pipeline name and construction sequence.
    ///
    /// Two units built by the same sequence of calls share a fingerprint;
    /// bound units contribute their own fingerprints.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        feed(&mut hasher, &["pipeline", &self.pipeline]);
        for op in &self.ops {
            match op {
                UnitOp::From { image } => feed(&mut hasher, &["from", image]),
                UnitOp::Build {
                    context,
                    dockerfile,
                    target,
                    args,
                } => {
                    feed(
                        &mut hasher,
                        &[
                            "build",
                            &context.path().to_string_lossy(),
                            dockerfile.as_deref().unwrap_or_default(),
                            target.as_deref().unwrap_or_default(),
                        ],
                    );
                    for (name, value) in args {
                        feed(&mut hasher, &["arg", name, value]);
                    }
                }
                UnitOp::Env { name, value } => feed(&mut hasher, &["env", name, value]),
                UnitOp::ExposePort { port, protocol } => {
                    feed(&mut hasher, &["expose", &port.to_string(), protocol.as_str()]);
                }
                UnitOp::MountDirectory {
                    target,
                    source,
                    read_only,
                } => feed(
                    &mut hasher,
                    &[
                        "mount-dir",
                        target,
                        &source.path().to_string_lossy(),
                        if *read_only { "ro" } else { "rw" },
                    ],
                ),
                UnitOp::MountCache { target, volume } => {
                    feed(&mut hasher, &["mount-cache", target, volume.name()]);
                }
                UnitOp::ServiceBinding { alias, unit } => {
                    feed(&mut hasher, &["bind", alias, &unit.fingerprint()]);
                }
                UnitOp::Exec {
                    args,
                    insecure_root_capabilities,
                } => {
                    feed(
                        &mut hasher,
                        &["exec", if *insecure_root_capabilities { "priv" } else { "" }],
                    );
                    for arg in args {
                        feed(&mut hasher, &["arg", arg]);
                    }
                }
            }
        }
        hasher
            .finalize()
            .iter()
            .fold(String::with_capacity(64), |mut out, b| {
                let _ = write!(out, "{b:02x}");
                out
            })
    }
}

/// Length-prefixes every field so adjacent fields cannot run together.
fn feed(hasher: &mut Sha256, fields: &[&str]) {
    for field in fields {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
}
