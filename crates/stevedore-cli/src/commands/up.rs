//! `stvd up`: Resolve the project and run every service.

use std::time::Instant;

use clap::Args;
use stevedore_common::config::StevedoreConfig;
use stevedore_runtime::engine::{self, Engine};
use stevedore_runtime::orchestrator::{RunReport, TaskKind};
use tokio_util::sync::CancellationToken;

use super::{CancellationArg, ResolutionArg};
use crate::output::{BOLD, DIM, GREEN, RESET, YELLOW, outcome_marker};

/// Arguments for the `up` command.
#[derive(Args, Debug)]
pub struct UpArgs {
    /// How services shared by several dependents are materialized.
    #[arg(long, value_enum, default_value_t = ResolutionArg::Memoized)]
    pub resolution: ResolutionArg,

    /// Whether one failing service stops the others.
    #[arg(long, value_enum, default_value_t = CancellationArg::Shared)]
    pub cancellation: CancellationArg,

    /// Seconds a container is given to stop before it is killed.
    #[arg(long, default_value_t = stevedore_common::constants::DEFAULT_STOP_GRACE_SECS)]
    pub stop_grace_secs: u32,
}

/// Executes the `up` command.
///
/// # Errors
///
/// Returns an error if the project cannot be loaded or resolved, or if any
/// service or endpoint fails once running.
pub fn execute(mut config: StevedoreConfig, args: UpArgs) -> anyhow::Result<()> {
    config.resolution = args.resolution.into();
    config.cancellation = args.cancellation.into();
    config.stop_grace_secs = args.stop_grace_secs;

    let started = Instant::now();
    let project = engine::load_project(&config).map_err(|e| anyhow::anyhow!("{e}"))?;
    let engine = Engine::docker(config, &project);
    if !engine.backend().is_available() {
        return Err(anyhow::anyhow!(
            "{} backend is not available: docker executable not found",
            engine.backend().name()
        ));
    }

    eprintln!();
    eprintln!(
        "  {BOLD}{}{RESET} {DIM}({} service(s)){RESET}",
        project.name,
        project.services.len()
    );
    eprintln!("  Press {BOLD}Ctrl+C{RESET} to stop all services...");
    eprintln!();

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    ctrlc::set_handler(move || on_signal.cancel())
        .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime
        .block_on(engine.up(&project, shutdown))
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    print_report(&report, started);
    report.into_result().map_err(|e| anyhow::anyhow!("{e}"))
}

fn print_report(report: &RunReport, started: Instant) {
    eprintln!();
    for task in &report.tasks {
        let indent = match task.kind {
            TaskKind::Service => "    ",
            TaskKind::Endpoint => "      ",
        };
        eprintln!("{indent}{} {}", outcome_marker(&task.outcome), task.label);
    }
    eprintln!();
    let elapsed = started.elapsed().as_secs_f64();
    if report.first_error().is_some() {
        eprintln!("  {YELLOW}Run failed{RESET} after {elapsed:.1}s.");
    } else if report.interrupted {
        eprintln!("  {GREEN}All services stopped{RESET} after {elapsed:.1}s.");
    } else {
        eprintln!("  {GREEN}All services completed{RESET} in {elapsed:.1}s.");
    }
}
