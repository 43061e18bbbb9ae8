//! Execution backend driving the `docker` CLI.
//!
//! Each unique unit (by fingerprint) becomes at most one container for the
//! lifetime of the backend. Running a unit starts every unit bound into it
//! first, so dependencies are reachable by their alias on the project
//! network before the dependent starts. A shared container lives as long
//! as the scope of the task that first started it.
//!
//! Starting is itself cancellable. A cancelled start drops every pending
//! `docker` invocation, which kills the child process.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stevedore_common::constants::{DEFAULT_DOCKER_BINARY, DEFAULT_STOP_GRACE_SECS, PROJECT_LABEL};
use stevedore_common::error::{Result, StevedoreError};
use stevedore_common::types::TransportProtocol;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell, watch};
use tokio_util::sync::CancellationToken;

use super::proxy;
use super::{ExecutionBackend, UnitExit};
use crate::publish::PublishedEndpoint;
use crate::unit::{CacheVolume, ExecutionUnit, HostDirectory, UnitOp};

const FINGERPRINT_PREFIX: usize = 12;
const INSPECT_ATTEMPTS: u32 = 50;
const INSPECT_INTERVAL: Duration = Duration::from_millis(200);

type StartFuture<'a> = Pin<Box<dyn Future<Output = Result<Arc<Instance>>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExitState {
    Running,
    Completed,
    Cancelled,
    Failed(String),
}

#[derive(Debug)]
struct Instance {
    container: String,
    exit: watch::Receiver<ExitState>,
}

impl Instance {
    async fn wait(&self) -> ExitState {
        let mut exit = self.exit.clone();
        match exit.wait_for(|state| *state != ExitState::Running).await {
            Ok(state) => state.clone(),
            Err(_) => ExitState::Failed("container supervisor stopped".into()),
        }
    }
}

/// Docker CLI backend scoped to one project.
#[derive(Debug)]
pub struct DockerBackend {
    binary: String,
    project: String,
    project_dir: PathBuf,
    stop_grace_secs: u32,
    network: OnceCell<String>,
    instances: Mutex<HashMap<String, Arc<OnceCell<Arc<Instance>>>>>,
}

impl DockerBackend {
    /// Creates a backend for `project` resolving relative paths against
    /// `project_dir`.
    #[must_use]
    pub fn new(project: impl Into<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: DEFAULT_DOCKER_BINARY.to_string(),
            project: project.into(),
            project_dir: project_dir.into(),
            stop_grace_secs: DEFAULT_STOP_GRACE_SECS,
            network: OnceCell::new(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Uses another docker executable.
    #[must_use]
    pub fn binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Sets the grace period given to containers on stop.
    #[must_use]
    pub const fn stop_grace_secs(mut self, secs: u32) -> Self {
        self.stop_grace_secs = secs;
        self
    }

    /// Name of the project network.
    #[must_use]
    pub fn network_name(&self) -> String {
        format!("{}_default", self.project)
    }

    /// Container name for `unit`.
    #[must_use]
    pub fn container_name(&self, unit: &ExecutionUnit) -> String {
        format!("{}-{}-{}", self.project, unit.pipeline(), short_fingerprint(unit))
    }

    async fn docker(&self, operation: &'static str, args: &[String]) -> Result<String> {
        tracing::debug!(binary = %self.binary, args = ?args, "docker");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StevedoreError::Backend {
                operation,
                message: format!("cannot execute {}: {e}", self.binary),
            })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(StevedoreError::Backend {
                operation,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn ensure_network(&self) -> Result<&str> {
        self.network
            .get_or_try_init(|| async {
                let name = self.network_name();
                let args = strings(&[
                    "network",
                    "create",
                    "--label",
                    &format!("{PROJECT_LABEL}={}", self.project),
                    &name,
                ]);
                match self.docker("create network", &args).await {
                    Ok(_) => tracing::info!(network = %name, "network created"),
                    Err(StevedoreError::Backend { message, .. })
                        if message.contains("already exists") =>
                    {
                        tracing::debug!(network = %name, "network exists");
                    }
                    Err(e) => return Err(e),
                }
                Ok(name)
            })
            .await
            .map(String::as_str)
    }

    async fn prepare_image(&self, unit: &ExecutionUnit) -> Result<String> {
        for op in unit.ops() {
            match op {
                UnitOp::From { image } => return Ok(image.clone()),
                UnitOp::Build {
                    context,
                    dockerfile,
                    target,
                    args,
                } => {
                    let tag = format!(
                        "{}-{}:{}",
                        self.project,
                        unit.pipeline(),
                        short_fingerprint(unit)
                    );
                    let build_args = build_args(
                        &tag,
                        context,
                        dockerfile.as_deref(),
                        target.as_deref(),
                        args,
                    );
                    tracing::info!(service = %unit.pipeline(), image = %tag, "building image");
                    let _ = self.docker("build image", &build_args).await?;
                    return Ok(tag);
                }
                _ => {}
            }
        }
        Err(StevedoreError::Backend {
            operation: "run",
            message: format!("unit {} has no base image", unit.pipeline()),
        })
    }

    fn ensure_started<'a>(
        &'a self,
        unit: &'a ExecutionUnit,
        cancel: &'a CancellationToken,
    ) -> StartFuture<'a> {
        Box::pin(async move {
            let cell = {
                let mut instances = self.instances.lock().await;
                Arc::clone(instances.entry(unit.fingerprint()).or_default())
            };
            let instance = cell.get_or_try_init(|| self.start(unit, cancel)).await?;
            Ok(Arc::clone(instance))
        })
    }

    async fn start(
        &self,
        unit: &ExecutionUnit,
        cancel: &CancellationToken,
    ) -> Result<Arc<Instance>> {
        for (alias, bound) in unit.service_bindings() {
            tracing::debug!(
                service = %unit.pipeline(),
                dependency = %alias,
                "starting bound service"
            );
            let _ = self.ensure_started(bound, cancel).await?;
        }

        let network = self.ensure_network().await?.to_string();
        let image = self.prepare_image(unit).await?;
        let container = self.container_name(unit);

        let _ = self
            .docker("remove container", &strings(&["rm", "-f", &container]))
            .await
            .or_else(|e| match e {
                StevedoreError::Backend { ref message, .. }
                    if message.contains("No such container") =>
                {
                    Ok(String::new())
                }
                other => Err(other),
            })?;

        if cancel.is_cancelled() {
            return Err(StevedoreError::Backend {
                operation: "run",
                message: format!("{} cancelled before its container started", unit.pipeline()),
            });
        }

        let args = run_args(&self.project, &network, &container, &image, unit);
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StevedoreError::Backend {
                operation: "run",
                message: format!("cannot execute {}: {e}", self.binary),
            })?;
        tracing::info!(service = %unit.pipeline(), %container, "container started");

        if let Some(stdout) = child.stdout.take() {
            forward_output(unit.pipeline().to_string(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(unit.pipeline().to_string(), stderr);
        }

        let (tx, rx) = watch::channel(ExitState::Running);
        let stop = StopCommand {
            binary: self.binary.clone(),
            container: container.clone(),
            grace_secs: self.stop_grace_secs,
        };
        let service = unit.pipeline().to_string();
        let cancel = cancel.clone();
        let _ = tokio::spawn(async move {
            let state = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => ExitState::Completed,
                    Ok(status) => ExitState::Failed(format!("container exited with {status}")),
                    Err(e) => ExitState::Failed(format!("cannot wait for container: {e}")),
                },
                () = cancel.cancelled() => {
                    stop.run().await;
                    let _ = child.wait().await;
                    ExitState::Cancelled
                }
            };
            tracing::info!(%service, state = ?state, "container exited");
            let _ = tx.send(state);
        });

        Ok(Arc::new(Instance { container, exit: rx }))
    }

    async fn container_ip(&self, container: &str) -> Result<IpAddr> {
        let format = "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}";
        for _ in 0..INSPECT_ATTEMPTS {
            let args = strings(&["inspect", "-f", format, container]);
            if let Ok(out) = self.docker("inspect container", &args).await {
                if let Some(ip) = out.split_whitespace().find_map(|s| s.parse().ok()) {
                    return Ok(ip);
                }
            }
            tokio::time::sleep(INSPECT_INTERVAL).await;
        }
        Err(StevedoreError::Backend {
            operation: "inspect container",
            message: format!("no address for container {container}"),
        })
    }
}

struct StopCommand {
    binary: String,
    container: String,
    grace_secs: u32,
}

impl StopCommand {
    async fn run(&self) {
        tracing::info!(container = %self.container, "stopping container");
        let result = Command::new(&self.binary)
            .args(["stop", "-t", &self.grace_secs.to_string(), &self.container])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            tracing::warn!(container = %self.container, error = %e, "docker stop failed");
        }
    }
}

#[async_trait]
impl ExecutionBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn host_directory(&self, path: &Path) -> Result<HostDirectory> {
        if path.is_absolute() {
            Ok(HostDirectory::new(path))
        } else {
            Ok(HostDirectory::new(self.project_dir.join(path)))
        }
    }

    fn cache_volume(&self, name: &str) -> Result<CacheVolume> {
        let valid = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !valid {
            return Err(StevedoreError::Backend {
                operation: "cache volume",
                message: format!("invalid volume name \"{name}\""),
            });
        }
        Ok(CacheVolume::new(format!("{}_{name}", self.project)))
    }

    async fn run(&self, unit: &ExecutionUnit, cancel: CancellationToken) -> Result<UnitExit> {
        let instance = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(UnitExit::Cancelled),
            started = self.ensure_started(unit, &cancel) => started?,
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(UnitExit::Cancelled),
            state = instance.wait() => match state {
                ExitState::Completed => Ok(UnitExit::Completed),
                ExitState::Running | ExitState::Cancelled => Ok(UnitExit::Cancelled),
                ExitState::Failed(message) => Err(StevedoreError::Backend {
                    operation: "run",
                    message,
                }),
            },
        }
    }

    async fn bind_socket(
        &self,
        unit: &ExecutionUnit,
        endpoint: &PublishedEndpoint,
        cancel: CancellationToken,
    ) -> Result<UnitExit> {
        let listen = endpoint.socket_addr()?;
        let instance = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(UnitExit::Cancelled),
            started = self.ensure_started(unit, &cancel) => started?,
        };
        let ip = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(UnitExit::Cancelled),
            ip = self.container_ip(&instance.container) => ip?,
        };
        let upstream = SocketAddr::new(ip, endpoint.target);
        match endpoint.protocol {
            TransportProtocol::Tcp => proxy::serve_tcp(listen, upstream, cancel).await,
            TransportProtocol::Udp => proxy::serve_udp(listen, upstream, cancel).await,
        }
    }

    fn is_available(&self) -> bool {
        which::which(&self.binary).is_ok()
    }
}

fn short_fingerprint(unit: &ExecutionUnit) -> String {
    let mut fingerprint = unit.fingerprint();
    fingerprint.truncate(FINGERPRINT_PREFIX);
    fingerprint
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

fn forward_output<R>(service: String, stream: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let _ = tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::info!(target: "stevedore::service", service = %service, "{line}");
        }
    });
}

fn build_args(
    tag: &str,
    context: &HostDirectory,
    dockerfile: Option<&str>,
    target: Option<&str>,
    args: &[(String, String)],
) -> Vec<String> {
    let mut out = strings(&["build", "-t", tag]);
    if let Some(dockerfile) = dockerfile {
        out.push("-f".into());
        out.push(context.path().join(dockerfile).to_string_lossy().into_owned());
    }
    if let Some(target) = target {
        out.push("--target".into());
        out.push(target.to_string());
    }
    for (name, value) in args {
        out.push("--build-arg".into());
        out.push(format!("{name}={value}"));
    }
    out.push(context.path().to_string_lossy().into_owned());
    out
}

/// Arguments for `docker run` materializing `unit` as `container`.
fn run_args(
    project: &str,
    network: &str,
    container: &str,
    image: &str,
    unit: &ExecutionUnit,
) -> Vec<String> {
    let mut args = strings(&[
        "run",
        "--rm",
        "--name",
        container,
        "--network",
        network,
        "--network-alias",
        unit.pipeline(),
        "--label",
        &format!("{PROJECT_LABEL}={project}"),
    ]);
    let mut command = Vec::new();
    for op in unit.ops() {
        match op {
            UnitOp::Env { name, value } => {
                args.push("-e".into());
                args.push(format!("{name}={value}"));
            }
            UnitOp::ExposePort { port, protocol } => {
                args.push("--expose".into());
                args.push(format!("{port}/{protocol}"));
            }
            UnitOp::MountDirectory {
                target,
                source,
                read_only,
            } => {
                args.push("-v".into());
                let mut spec = format!("{}:{target}", source.path().display());
                if *read_only {
                    spec.push_str(":ro");
                }
                args.push(spec);
            }
            UnitOp::MountCache { target, volume } => {
                args.push("-v".into());
                args.push(format!("{}:{target}", volume.name()));
            }
            UnitOp::Exec {
                args: exec,
                insecure_root_capabilities,
            } => {
                if *insecure_root_capabilities {
                    args.push("--privileged".into());
                }
                command.clone_from(exec);
            }
            UnitOp::From { .. } | UnitOp::Build { .. } | UnitOp::ServiceBinding { .. } => {}
        }
    }
    args.push(image.to_string());
    args.extend(command);
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> DockerBackend {
        DockerBackend::new("demo", "/srv/demo").stop_grace_secs(3)
    }

    #[test]
    fn relative_paths_resolve_against_the_project() {
        let b = backend();
        assert_eq!(
            b.host_directory(Path::new("data")).expect("dir").path(),
            Path::new("/srv/demo/data")
        );
        assert_eq!(
            b.host_directory(Path::new("/etc/app")).expect("dir").path(),
            Path::new("/etc/app")
        );
    }

    #[test]
    fn volumes_are_project_scoped() {
        let b = backend();
        assert_eq!(b.cache_volume("pgdata").expect("volume").name(), "demo_pgdata");
        assert!(b.cache_volume("../escape").is_err());
        assert!(b.cache_volume("").is_err());
    }

    #[test]
    fn container_names_follow_the_fingerprint() {
        let b = backend();
        let unit = ExecutionUnit::new("db").with_image("postgres");
        let name = b.container_name(&unit);
        assert!(name.starts_with("demo-db-"), "got: {name}");
        assert_eq!(name.len(), "demo-db-".len() + FINGERPRINT_PREFIX);
        assert_eq!(name, b.container_name(&unit.clone()));
        assert_eq!(b.network_name(), "demo_default");
    }

    #[test]
    fn run_args_cover_every_step() {
        let unit = ExecutionUnit::new("web")
            .with_image("app")
            .with_env_variable("MODE", "prod")
            .with_exposed_port(80, TransportProtocol::Tcp)
            .with_mounted_directory("/app", HostDirectory::new("/srv/demo/src"), true)
            .with_mounted_cache("/cache", CacheVolume::new("demo_cache"))
            .with_service_binding("db", Arc::new(ExecutionUnit::new("db").with_image("postgres")))
            .with_exec(vec!["serve".into(), "--port".into(), "80".into()], true);
        let args = run_args("demo", "demo_default", "demo-web-x", "app", &unit);
        assert_eq!(
            args,
            strings(&[
                "run",
                "--rm",
                "--name",
                "demo-web-x",
                "--network",
                "demo_default",
                "--network-alias",
                "web",
                "--label",
                "io.stevedore.project=demo",
                "-e",
                "MODE=prod",
                "--expose",
                "80/tcp",
                "-v",
                "/srv/demo/src:/app:ro",
                "-v",
                "demo_cache:/cache",
                "--privileged",
                "app",
                "serve",
                "--port",
                "80",
            ])
        );
    }

    #[test]
    fn build_args_include_only_given_options() {
        let ctx = HostDirectory::new("/srv/demo/api");
        let build = [("V".to_string(), "1".to_string())];
        let args = build_args("demo-api:abc", &ctx, Some("Dockerfile.dev"), None, &build);
        assert_eq!(
            args,
            strings(&[
                "build",
                "-t",
                "demo-api:abc",
                "-f",
                "/srv/demo/api/Dockerfile.dev",
                "--build-arg",
                "V=1",
                "/srv/demo/api",
            ])
        );
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let b = backend().binary("stevedore-no-such-docker-binary");
        assert!(!b.is_available());
    }

    /// Writes an executable stand-in for `docker` that sleeps on `build`.
    #[cfg(unix)]
    fn slow_build_docker(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("docker");
        std::fs::write(
            &path,
            "#!/bin/sh\ncase \"$1\" in\n  build) sleep 5 ;;\n  *) exit 0 ;;\nesac\n",
        )
        .expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_interrupts_a_running_build() {
        let dir = tempfile::tempdir().expect("tempdir");
        let docker = slow_build_docker(dir.path());
        let backend = DockerBackend::new("demo", dir.path()).binary(docker.to_string_lossy());
        let unit = ExecutionUnit::new("api").with_build(
            HostDirectory::new(dir.path()),
            None,
            None,
            Vec::new(),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let exit = backend.run(&unit, cancel).await.expect("run");
        assert_eq!(exit, UnitExit::Cancelled);
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "build kept running for {:?}",
            started.elapsed()
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_endpoint_does_not_wait_for_the_build() {
        let dir = tempfile::tempdir().expect("tempdir");
        let docker = slow_build_docker(dir.path());
        let backend = DockerBackend::new("demo", dir.path()).binary(docker.to_string_lossy());
        let unit = ExecutionUnit::new("api").with_build(
            HostDirectory::new(dir.path()),
            None,
            None,
            Vec::new(),
        );
        let endpoint = PublishedEndpoint {
            address: "127.0.0.1:0".into(),
            family: stevedore_common::types::AddressFamily::Ipv4,
            published: 0,
            target: 80,
            protocol: TransportProtocol::Tcp,
        };

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let _ = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let exit = tokio::time::timeout(
            Duration::from_secs(3),
            backend.bind_socket(&unit, &endpoint, cancel),
        )
        .await
        .expect("bind_socket ignored cancellation")
        .expect("bind_socket");
        assert_eq!(exit, UnitExit::Cancelled);
    }

    #[tokio::test]
    async fn unit_without_base_cannot_run() {
        let b = backend();
        let err = b.prepare_image(&ExecutionUnit::new("bare")).await.unwrap_err();
        assert!(err.to_string().contains("no base image"), "got: {err}");
    }
}
