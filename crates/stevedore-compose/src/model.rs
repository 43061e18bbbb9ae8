//! Service descriptor model.
//!
//! A [`Project`] is the loader's output and is read-only for the whole
//! orchestration. Maps that compose leaves unordered (environment, build
//! args) stay unordered here; consumers that need a stable order sort them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A loaded multi-service project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    /// Normalised project name.
    pub name: String,
    /// Directory relative paths were resolved against.
    pub working_dir: PathBuf,
    /// Service descriptors keyed by service name.
    pub services: BTreeMap<String, ServiceDescriptor>,
}

impl Project {
    /// Creates an empty project.
    #[must_use]
    pub fn new(name: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            working_dir: working_dir.into(),
            services: BTreeMap::new(),
        }
    }

    /// Adds a service, replacing any previous service with the same name.
    #[must_use]
    pub fn with_service(mut self, service: ServiceDescriptor) -> Self {
        let _ = self.services.insert(service.name.clone(), service);
        self
    }

    /// Looks up a service by name.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    /// Service names in ascending order.
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }
}

/// Declarative specification of one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique key within the project.
    pub name: String,
    /// Base image reference.
    pub image: Option<String>,
    /// Build instructions used when no image is given.
    pub build: Option<BuildSpec>,
    /// Command run in the service; empty keeps the image default.
    pub command: Vec<String>,
    /// Environment variables; `None` values are declared but unset.
    pub environment: HashMap<String, Option<String>>,
    /// Published ports in declaration order.
    pub ports: Vec<PortConfig>,
    /// Ports exposed to other services only.
    pub expose: Vec<String>,
    /// Volume mounts in declaration order.
    pub volumes: Vec<VolumeMount>,
    /// Names of services this one depends on.
    pub depends_on: BTreeSet<String>,
    /// Whether the service runs with extended privileges.
    pub privileged: bool,
}

impl ServiceDescriptor {
    /// Creates an empty descriptor for `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the image reference.
    #[must_use]
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Adds an environment entry.
    #[must_use]
    pub fn env(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        let _ = self
            .environment
            .insert(name.into(), value.map(ToString::to_string));
        self
    }

    /// Adds a published port.
    #[must_use]
    pub fn port(mut self, port: PortConfig) -> Self {
        self.ports.push(port);
        self
    }

    /// Adds a dependency on another service.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        let _ = self.depends_on.insert(name.into());
        self
    }
}

/// Instructions for building a service image from a context directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Build context directory.
    pub context: PathBuf,
    /// Dockerfile path relative to the context.
    pub dockerfile: Option<String>,
    /// Multi-stage build target.
    pub target: Option<String>,
    /// Build arguments; `None` values are declared but unset.
    pub args: HashMap<String, Option<String>>,
}

/// A port mapping from a host address to a service port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Port inside the service.
    pub target: u16,
    /// Host port as written; validated when the service is built.
    pub published: String,
    /// Host address to bind, if restricted.
    pub host_ip: Option<String>,
    /// Publication mode; only `ingress` is supported.
    pub mode: String,
    /// Declared transport protocol; empty means TCP.
    pub protocol: String,
}

impl PortConfig {
    /// An ingress TCP mapping of `published` to `target`.
    #[must_use]
    pub fn ingress(published: impl Into<String>, target: u16) -> Self {
        Self {
            target,
            published: published.into(),
            host_ip: None,
            mode: stevedore_common::constants::INGRESS_MODE.to_string(),
            protocol: String::new(),
        }
    }

    /// Replaces the declared protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Replaces the publication mode.
    #[must_use]
    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }
}

/// Kind of a volume mount.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VolumeType {
    /// A host directory.
    Bind,
    /// A named volume managed by the backend.
    Volume,
    /// Any other compose volume type (`tmpfs`, `npipe`, `cluster`, ...).
    Other(String),
}

impl From<&str> for VolumeType {
    fn from(value: &str) -> Self {
        match value {
            "bind" => Self::Bind,
            "volume" => Self::Volume,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for VolumeType {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<VolumeType> for String {
    fn from(value: VolumeType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind => f.write_str("bind"),
            Self::Volume => f.write_str("volume"),
            Self::Other(kind) => f.write_str(kind),
        }
    }
}

/// A volume mounted into a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Mount kind.
    pub kind: VolumeType,
    /// Host path for binds, volume name for named volumes.
    pub source: Option<String>,
    /// Path inside the service.
    pub target: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}
