//! Runtime engine tying loading, resolution and orchestration together.

use std::sync::Arc;

use stevedore_common::config::StevedoreConfig;
use stevedore_common::error::Result;
use stevedore_compose::graph::DependencyGraph;
use stevedore_compose::{ComposeLoader, LoaderOptions, Project, ProjectLoader};
use tokio_util::sync::CancellationToken;

use crate::backend::ExecutionBackend;
use crate::backend::docker::DockerBackend;
use crate::orchestrator::{Orchestrator, RunReport};
use crate::resolver::{self, ResolvedService};

/// A resolved project ready to launch, in dependency order.
#[derive(Debug)]
pub struct Plan {
    /// Service names, dependencies first.
    pub order: Vec<String>,
    /// Resolved services in `order`.
    pub services: Vec<ResolvedService>,
}

/// Loads a project from the locations `config` names.
///
/// The OS environment, `COMPOSE_FILE` and the default file names are all
/// honoured; explicit files win over both.
///
/// # Errors
///
/// Returns [`StevedoreError::Loader`](stevedore_common::error::StevedoreError::Loader)
/// or an I/O error if no valid project can be read.
pub fn load_project(config: &StevedoreConfig) -> Result<Project> {
    let options = LoaderOptions::new()
        .working_dir(&config.working_dir)
        .config_files(config.compose_files.clone())
        .project_name(config.project_name.clone())
        .os_env()
        .config_file_env()
        .default_config_path();
    ComposeLoader::new(options).load()
}

/// Coordinates one project against one backend.
pub struct Engine {
    config: StevedoreConfig,
    backend: Arc<dyn ExecutionBackend>,
}

impl Engine {
    /// Creates an engine using the Docker backend for `project`.
    #[must_use]
    pub fn docker(config: StevedoreConfig, project: &Project) -> Self {
        let backend = DockerBackend::new(&project.name, &project.working_dir)
            .binary(&config.docker_binary)
            .stop_grace_secs(config.stop_grace_secs);
        Self::with_backend(config, Arc::new(backend))
    }

    /// Creates an engine over an arbitrary backend.
    #[must_use]
    pub fn with_backend(config: StevedoreConfig, backend: Arc<dyn ExecutionBackend>) -> Self {
        Self { config, backend }
    }

    /// The backend this engine drives.
    #[must_use]
    pub fn backend(&self) -> &dyn ExecutionBackend {
        self.backend.as_ref()
    }

    /// Resolves every service of `project`.
    ///
    /// # Errors
    ///
    /// Returns the first configuration or resolution error.
    pub fn resolve(&self, project: &Project) -> Result<Vec<ResolvedService>> {
        resolver::resolve_project(self.backend.as_ref(), project, self.config.resolution)
    }

    /// Resolves `project` and orders it for display.
    ///
    /// # Errors
    ///
    /// Returns the first configuration, graph or resolution error.
    pub fn plan(&self, project: &Project) -> Result<Plan> {
        let order = DependencyGraph::from_project(project)?.launch_order()?;
        let mut resolved = self.resolve(project)?;
        let services = order
            .iter()
            .filter_map(|name| {
                resolved
                    .iter()
                    .position(|s| &s.name == name)
                    .map(|idx| resolved.swap_remove(idx))
            })
            .collect();
        Ok(Plan { order, services })
    }

    /// Resolves and runs `project` until every task ends or `shutdown`
    /// fires.
    ///
    /// Resolution errors are returned before anything is launched.
    ///
    /// # Errors
    ///
    /// Returns the first configuration or resolution error.
    pub async fn up(&self, project: &Project, shutdown: CancellationToken) -> Result<RunReport> {
        let services = self.resolve(project)?;
        tracing::info!(
            project = %project.name,
            backend = self.backend.name(),
            services = services.len(),
            "launching project"
        );
        let orchestrator = Orchestrator::new(Arc::clone(&self.backend))
            .with_policy(self.config.cancellation)
            .with_shutdown(shutdown);
        Ok(orchestrator.execute(&services).await)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use stevedore_compose::ServiceDescriptor;

    use super::*;

    #[test]
    fn load_project_uses_explicit_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("stack.yml"),
            "name: shop\nservices:\n  db:\n    image: postgres\n",
        )
        .expect("write");
        let config = StevedoreConfig {
            working_dir: dir.path().to_path_buf(),
            compose_files: vec!["stack.yml".into()],
            ..StevedoreConfig::default()
        };
        let project = load_project(&config).expect("load");
        assert_eq!(project.name, "shop");
        assert!(project.service("db").is_some());
    }

    #[test]
    fn plan_lists_dependencies_first() {
        let project = Project::new("demo", "/srv/demo")
            .with_service(ServiceDescriptor::new("web").image("app").depends_on("db"))
            .with_service(ServiceDescriptor::new("db").image("postgres"))
            .with_service(ServiceDescriptor::new("api").image("api").depends_on("web"));
        let engine = Engine::docker(StevedoreConfig::default(), &project);
        let plan = engine.plan(&project).expect("plan");
        assert_eq!(plan.order, vec!["db", "web", "api"]);
        let names: Vec<&str> = plan.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, plan.order);
    }

    #[test]
    fn plan_reports_cycles_before_resolving() {
        let project = Project::new("demo", "/srv/demo")
            .with_service(ServiceDescriptor::new("a").image("a").depends_on("b"))
            .with_service(ServiceDescriptor::new("b").image("b").depends_on("a"));
        let engine = Engine::docker(StevedoreConfig::default(), &project);
        assert!(engine.plan(&project).unwrap_err().is_pre_launch());
    }
}
