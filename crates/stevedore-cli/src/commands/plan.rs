//! `stvd plan`: Display launch order and construction steps without
//! running anything.

use clap::Args;
use stevedore_common::config::StevedoreConfig;
use stevedore_runtime::engine::{self, Engine};

use super::ResolutionArg;
use crate::output::{describe_op, rule};

/// Arguments for the `plan` command.
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// How services shared by several dependents are materialized.
    #[arg(long, value_enum, default_value_t = ResolutionArg::Memoized)]
    pub resolution: ResolutionArg,
}

/// Executes the `plan` command.
///
/// Loads the project, orders it by `depends_on` and resolves every
/// service, then prints each unit's construction steps and endpoints.
///
/// # Errors
///
/// Returns an error if loading, graph ordering or resolution fails.
pub fn execute(mut config: StevedoreConfig, args: PlanArgs) -> anyhow::Result<()> {
    config.resolution = args.resolution.into();
    let project = engine::load_project(&config).map_err(|e| anyhow::anyhow!("{e}"))?;
    let engine = Engine::docker(config, &project);
    let plan = engine.plan(&project).map_err(|e| anyhow::anyhow!("{e}"))?;

    let title = format!("Launch Plan for: {}", project.name);
    println!("{title}");
    println!("{}", rule(title.chars().count()));
    println!();

    for service in &plan.services {
        println!("  + {}", service.name);
        for op in service.unit.ops() {
            println!("      {}", describe_op(op));
        }
        for endpoint in &service.endpoints {
            println!("      publish {endpoint}");
        }
    }

    println!();
    println!("  {} service(s) will be launched.", plan.order.len());
    println!("  Order: {}", plan.order.join(" -> "));

    Ok(())
}
