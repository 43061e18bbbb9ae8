//! `stvd config`: Print the normalised project.

use clap::{Args, ValueEnum};
use stevedore_common::config::StevedoreConfig;
use stevedore_runtime::engine;

/// Output format of the `config` command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ConfigFormat {
    /// YAML document.
    Yaml,
    /// Pretty-printed JSON.
    Json,
}

/// Arguments for the `config` command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Output format.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Yaml)]
    pub format: ConfigFormat,

    /// Print only the service names.
    #[arg(long)]
    pub services: bool,
}

/// Executes the `config` command.
///
/// # Errors
///
/// Returns an error if the project cannot be loaded or serialized.
pub fn execute(config: &StevedoreConfig, args: &ConfigArgs) -> anyhow::Result<()> {
    let project = engine::load_project(config).map_err(|e| anyhow::anyhow!("{e}"))?;

    if args.services {
        for name in project.service_names() {
            println!("{name}");
        }
        return Ok(());
    }

    let rendered = match args.format {
        ConfigFormat::Yaml => serde_yaml::to_string(&project)?,
        ConfigFormat::Json => serde_json::to_string_pretty(&project)?,
    };
    println!("{rendered}");
    Ok(())
}
