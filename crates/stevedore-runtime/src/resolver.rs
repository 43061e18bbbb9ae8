//! Depth-first dependency resolution.
//!
//! Each service's dependencies are resolved before its own unit is
//! finalized, and every resolved dependency is bound into the dependent
//! under its service name. An in-progress stack detects cycles; a
//! name-keyed memo shares one unit per service under
//! [`ResolutionPolicy::Memoized`].

use std::collections::HashMap;
use std::sync::Arc;

use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::ResolutionPolicy;
use stevedore_compose::model::Project;

use crate::backend::ExecutionBackend;
use crate::builder;
use crate::publish::{self, PublishedEndpoint};
use crate::unit::ExecutionUnit;

/// A fully bound execution unit plus the endpoints it publishes.
#[derive(Debug, Clone)]
pub struct ResolvedService {
    /// Service name.
    pub name: String,
    /// Finalized unit with every dependency bound.
    pub unit: Arc<ExecutionUnit>,
    /// Host endpoints derived from the service's ingress ports.
    pub endpoints: Vec<PublishedEndpoint>,
}

/// Resolves services of one project against one backend.
pub struct Resolver<'a> {
    backend: &'a dyn ExecutionBackend,
    project: &'a Project,
    policy: ResolutionPolicy,
    resolved: HashMap<String, Arc<ResolvedService>>,
    in_progress: Vec<String>,
    units_built: usize,
}

impl<'a> Resolver<'a> {
    /// Creates a resolver with an empty memo.
    #[must_use]
    pub fn new(
        backend: &'a dyn ExecutionBackend,
        project: &'a Project,
        policy: ResolutionPolicy,
    ) -> Self {
        Self {
            backend,
            project,
            policy,
            resolved: HashMap::new(),
            in_progress: Vec::new(),
            units_built: 0,
        }
    }

    /// Number of units built so far.
    #[must_use]
    pub const fn units_built(&self) -> usize {
        self.units_built
    }

    /// Resolves `name` and its whole dependency subtree.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::UnknownService`] for an undefined name,
    /// [`StevedoreError::CyclicDependency`] when the subtree loops back on
    /// itself, and any error raised while building a unit.
    pub fn resolve(&mut self, name: &str) -> Result<Arc<ResolvedService>> {
        let requester = self.project.name.clone();
        self.resolve_from(&requester, name)
    }

    fn resolve_from(&mut self, requester: &str, name: &str) -> Result<Arc<ResolvedService>> {
        if let Some(start) = self.in_progress.iter().position(|n| n == name) {
            let mut cycle = self.in_progress[start..].to_vec();
            cycle.push(name.to_string());
            return Err(StevedoreError::CyclicDependency { cycle });
        }
        if self.policy == ResolutionPolicy::Memoized {
            if let Some(done) = self.resolved.get(name) {
                return Ok(Arc::clone(done));
            }
        }

        self.in_progress.push(name.to_string());
        let result = self.resolve_uncached(requester, name);
        let _ = self.in_progress.pop();

        let resolved = Arc::new(result?);
        if self.policy == ResolutionPolicy::Memoized {
            let _ = self
                .resolved
                .insert(name.to_string(), Arc::clone(&resolved));
        }
        Ok(resolved)
    }

    fn resolve_uncached(&mut self, requester: &str, name: &str) -> Result<ResolvedService> {
        let project = self.project;
        let service = project
            .service(name)
            .ok_or_else(|| StevedoreError::UnknownService {
                service: requester.to_string(),
                dependency: name.to_string(),
            })?;

        let mut unit = builder::build_unit(self.backend, service)?;
        self.units_built += 1;
        let endpoints = publish::published_endpoints(service)?;

        for dependency in &service.depends_on {
            let bound = self.resolve_from(name, dependency)?;
            tracing::debug!(service = %name, dependency = %dependency, "binding dependency");
            unit = unit.with_service_binding(dependency, Arc::clone(&bound.unit));
        }

        Ok(ResolvedService {
            name: name.to_string(),
            unit: Arc::new(builder::finalize_unit(unit, service)),
            endpoints,
        })
    }
}

/// Resolves every service of `project` in name order.
///
/// Resolution is all-or-nothing: the first error aborts before anything
/// could be launched.
///
/// # Errors
///
/// Returns the first resolution error.
pub fn resolve_project(
    backend: &dyn ExecutionBackend,
    project: &Project,
    policy: ResolutionPolicy,
) -> Result<Vec<ResolvedService>> {
    let mut resolver = Resolver::new(backend, project, policy);
    let services = project
        .service_names()
        .map(|name| resolver.resolve(name).map(|r| (*r).clone()))
        .collect::<Result<Vec<_>>>()?;
    tracing::info!(
        project = %project.name,
        services = services.len(),
        units = resolver.units_built(),
        ?policy,
        "project resolved"
    );
    Ok(services)
}
