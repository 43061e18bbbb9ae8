//! Concurrent execution of resolved services and their endpoints.
//!
//! One task runs per service and one per published endpoint, all inside a
//! single scope derived from the caller's shutdown token. Under
//! [`CancellationPolicy::Shared`] the first failing task cancels the scope;
//! under [`CancellationPolicy::Independent`] siblings run on and only the
//! first error is kept. Nothing is retried.
//!
//! Endpoint tasks are scoped to their service: once a service task ends,
//! its endpoints are cancelled.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::CancellationPolicy;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::backend::{ExecutionBackend, UnitExit};
use crate::publish::PublishedEndpoint;
use crate::resolver::ResolvedService;

/// What a launched task drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// A service's execution unit.
    Service,
    /// A published endpoint of a service.
    Endpoint,
}

/// How a launched task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Returned without error.
    Completed,
    /// Stopped because its scope was cancelled.
    Cancelled,
    /// Failed with the given message.
    Failed(String),
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed(message) => write!(f, "failed: {message}"),
        }
    }
}

/// Final state of one task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// Task label used in logs and errors.
    pub label: String,
    /// Owning service.
    pub service: String,
    /// Task kind.
    pub kind: TaskKind,
    /// How the task ended.
    pub outcome: TaskOutcome,
}

/// Aggregate result of one orchestration.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Task reports in completion order.
    pub tasks: Vec<TaskReport>,
    /// Whether the run was stopped by the caller's shutdown token.
    pub interrupted: bool,
    first_error: Option<StevedoreError>,
}

impl RunReport {
    /// The first task failure, if any.
    #[must_use]
    pub const fn first_error(&self) -> Option<&StevedoreError> {
        self.first_error.as_ref()
    }

    /// Outcome of the service task for `service`.
    #[must_use]
    pub fn service_outcome(&self, service: &str) -> Option<&TaskOutcome> {
        self.tasks
            .iter()
            .find(|t| t.kind == TaskKind::Service && t.service == service)
            .map(|t| &t.outcome)
    }

    /// Outcome of the task with the given label.
    #[must_use]
    pub fn outcome_of(&self, label: &str) -> Option<&TaskOutcome> {
        self.tasks
            .iter()
            .find(|t| t.label == label)
            .map(|t| &t.outcome)
    }

    /// Converts the report into the run's result.
    ///
    /// An interrupted run with no failure is a clean stop.
    ///
    /// # Errors
    ///
    /// Returns the first task failure.
    pub fn into_result(self) -> Result<()> {
        self.first_error.map_or(Ok(()), Err)
    }
}

/// Task label for a service.
#[must_use]
pub fn service_label(service: &str) -> String {
    format!("service \"{service}\"")
}

/// Task label for an endpoint of `service`.
#[must_use]
pub fn endpoint_label(service: &str, endpoint: &PublishedEndpoint) -> String {
    format!(
        "endpoint {} -> {service}:{}/{}",
        endpoint.address, endpoint.target, endpoint.protocol
    )
}

struct TaskMeta {
    label: String,
    service: String,
    kind: TaskKind,
}

/// Runs resolved services concurrently against one backend.
pub struct Orchestrator {
    backend: Arc<dyn ExecutionBackend>,
    policy: CancellationPolicy,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Creates an orchestrator with the shared cancellation policy.
    #[must_use]
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            backend,
            policy: CancellationPolicy::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Sets the cancellation policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: CancellationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Uses `shutdown` as the parent of the run's scope.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Runs every service and endpoint and returns once all tasks ended.
    pub async fn execute(&self, services: &[ResolvedService]) -> RunReport {
        let scope = self.shutdown.child_token();
        let mut tasks: JoinSet<Result<UnitExit>> = JoinSet::new();
        let mut meta: HashMap<Id, TaskMeta> = HashMap::new();

        for service in services {
            let service_token = match self.policy {
                CancellationPolicy::Shared => scope.clone(),
                CancellationPolicy::Independent => scope.child_token(),
            };
            let endpoint_scope = service_token.child_token();

            let backend = Arc::clone(&self.backend);
            let unit = Arc::clone(&service.unit);
            let token = service_token.clone();
            let endpoints_done = endpoint_scope.clone();
            let name = service.name.clone();
            let handle = tasks.spawn(async move {
                tracing::info!(service = %name, "starting service");
                let result = backend.run(&unit, token).await;
                endpoints_done.cancel();
                result
            });
            let _ = meta.insert(
                handle.id(),
                TaskMeta {
                    label: service_label(&service.name),
                    service: service.name.clone(),
                    kind: TaskKind::Service,
                },
            );

            for endpoint in &service.endpoints {
                let backend = Arc::clone(&self.backend);
                let unit = Arc::clone(&service.unit);
                let endpoint = endpoint.clone();
                let token = endpoint_scope.clone();
                let label = endpoint_label(&service.name, &endpoint);
                let handle = tasks.spawn(async move {
                    tracing::info!(
                        endpoint = %endpoint,
                        service = %unit.pipeline(),
                        "binding endpoint"
                    );
                    backend.bind_socket(&unit, &endpoint, token).await
                });
                let _ = meta.insert(
                    handle.id(),
                    TaskMeta {
                        label,
                        service: service.name.clone(),
                        kind: TaskKind::Endpoint,
                    },
                );
            }
        }

        tracing::debug!(tasks = meta.len(), policy = ?self.policy, "orchestration started");

        let mut report = RunReport::default();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (task_id, result) = split_join(joined);
            let Some(task) = meta.remove(&task_id) else {
                continue;
            };
            let outcome = match result {
                Ok(UnitExit::Completed) => {
                    tracing::info!(task = %task.label, "task completed");
                    TaskOutcome::Completed
                }
                Ok(UnitExit::Cancelled) => {
                    tracing::debug!(task = %task.label, "task cancelled");
                    TaskOutcome::Cancelled
                }
                Err(message) => {
                    tracing::error!(task = %task.label, error = %message, "task failed");
                    if report.first_error.is_none() {
                        report.first_error =
                            Some(StevedoreError::execution(&task.label, &message));
                    }
                    if self.policy == CancellationPolicy::Shared {
                        scope.cancel();
                    }
                    TaskOutcome::Failed(message)
                }
            };
            report.tasks.push(TaskReport {
                label: task.label,
                service: task.service,
                kind: task.kind,
                outcome,
            });
        }

        report.interrupted = self.shutdown.is_cancelled();
        if report.interrupted && report.first_error.is_none() {
            tracing::info!("orchestration stopped on request");
        }
        report
    }

    /// Runs every service and endpoint and returns the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`StevedoreError::Execution`] for the first task that failed.
    pub async fn run(&self, services: &[ResolvedService]) -> Result<()> {
        self.execute(services).await.into_result()
    }
}

fn split_join(
    joined: std::result::Result<(Id, Result<UnitExit>), JoinError>,
) -> (Id, std::result::Result<UnitExit, String>) {
    match joined {
        Ok((id, result)) => (id, result.map_err(|e| e.to_string())),
        Err(e) => {
            let reason = if e.is_panic() {
                "task panicked".to_string()
            } else {
                "task aborted".to_string()
            };
            (e.id(), Err(reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stevedore_common::types::{AddressFamily, TransportProtocol};

    #[test]
    fn labels_name_the_service() {
        let endpoint = PublishedEndpoint {
            address: ":8080".into(),
            family: AddressFamily::Unspecified,
            published: 8080,
            target: 80,
            protocol: TransportProtocol::Tcp,
        };
        assert_eq!(service_label("db"), "service \"db\"");
        assert_eq!(endpoint_label("web", &endpoint), "endpoint :8080 -> web:80/tcp");
    }

    #[test]
    fn clean_report_is_ok() {
        let report = RunReport {
            interrupted: true,
            ..RunReport::default()
        };
        assert!(report.into_result().is_ok());
    }

    #[test]
    fn first_error_wins() {
        let report = RunReport {
            first_error: Some(StevedoreError::execution("service \"db\"", "exit status 1")),
            ..RunReport::default()
        };
        let msg = report.into_result().unwrap_err().to_string();
        assert!(msg.contains("service \"db\""), "got: {msg}");
    }
}
