//! CLI command definitions and dispatch.

pub mod config;
pub mod plan;
pub mod up;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use stevedore_common::config::StevedoreConfig;
use stevedore_common::constants::{COMPOSE_PROJECT_NAME_ENV, DEFAULT_DOCKER_BINARY};
use stevedore_common::types::{CancellationPolicy, ResolutionPolicy};

/// Stevedore: compose service graphs resolved and run concurrently.
#[derive(Parser, Debug)]
#[command(name = "stvd", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Compose file(s) to load, in override order.
    #[arg(short = 'f', long = "file", global = true)]
    pub files: Vec<PathBuf>,

    /// Project name.
    #[arg(short = 'p', long, global = true, env = COMPOSE_PROJECT_NAME_ENV)]
    pub project_name: Option<String>,

    /// Directory compose files are discovered from.
    #[arg(long, global = true, default_value = ".")]
    pub project_directory: PathBuf,

    /// Docker executable.
    #[arg(long, global = true, env = "STEVEDORE_DOCKER", default_value = DEFAULT_DOCKER_BINARY)]
    pub docker: String,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Cli {
    /// Builds the run configuration from the global options.
    #[must_use]
    pub fn config(&self) -> StevedoreConfig {
        StevedoreConfig {
            working_dir: self.project_directory.clone(),
            compose_files: self.files.clone(),
            project_name: self.project_name.clone(),
            docker_binary: self.docker.clone(),
            ..StevedoreConfig::default()
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// How shared dependencies are materialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ResolutionArg {
    /// One unit per service, shared by all dependents.
    Memoized,
    /// One unit per dependency edge.
    PerEdge,
}

impl From<ResolutionArg> for ResolutionPolicy {
    fn from(value: ResolutionArg) -> Self {
        match value {
            ResolutionArg::Memoized => Self::Memoized,
            ResolutionArg::PerEdge => Self::PerEdge,
        }
    }
}

/// How a failing service affects the others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CancellationArg {
    /// The first failure stops everything.
    Shared,
    /// Other services keep running.
    Independent,
}

impl From<CancellationArg> for CancellationPolicy {
    fn from(value: CancellationArg) -> Self {
        match value {
            CancellationArg::Shared => Self::Shared,
            CancellationArg::Independent => Self::Independent,
        }
    }
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve the project and run every service until one fails or Ctrl+C.
    Up(up::UpArgs),
    /// Show launch order, construction steps and endpoints without running.
    Plan(plan::PlanArgs),
    /// Print the normalised project.
    Config(config::ConfigArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config();
    match cli.command {
        Command::Up(args) => up::execute(config, args),
        Command::Plan(args) => plan::execute(config, args),
        Command::Config(args) => config::execute(&config, &args),
    }
}
