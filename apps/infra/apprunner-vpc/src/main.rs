//! apprunner-vpc
//!
//! Synthesizes the App Runner + VPC demo stack into a CloudFormation
//! template and inspects the resulting resource graph.

use std::fs;
use std::path::PathBuf;

use apprunner_vpc::{StackConfig, SynthesizedStack, all_passed, build_stack, run_checks};
use clap::{Parser, Subcommand, ValueEnum};
use core_config::tracing::{init_tracing, install_color_eyre};
use core_config::{DeployTarget, Environment};
use eyre::{Result, WrapErr, bail};
use infra_graph::diff_templates;
use serde_json::Value;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Variant {
    /// Edge service fronts the internal service only
    A,
    /// Adds a load balanced public service and fronts it instead
    B,
}

#[derive(Parser)]
#[command(name = "apprunner-vpc")]
#[command(about = "Synthesize the App Runner + VPC demo stack")]
struct Cli {
    /// JSON stack configuration; overrides --variant
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Built-in configuration preset
    #[arg(long, value_enum, default_value = "a", global = true)]
    variant: Variant,

    /// Target account id (falls back to CDK_DEFAULT_ACCOUNT)
    #[arg(long, global = true)]
    account: Option<String>,

    /// Target region (falls back to CDK_DEFAULT_REGION)
    #[arg(long, global = true)]
    region: Option<String>,

    /// Deployment stage suffix (falls back to DEPLOY_ENV)
    #[arg(long, global = true)]
    deploy_env: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the template and asset manifest
    Synth {
        /// Output directory, or "-" to print the template
        #[arg(short, long, default_value = "cdk.out")]
        out: String,
    },

    /// Compare against a previously synthesized template
    Diff {
        #[arg(long)]
        against: PathBuf,
    },

    /// Show creation waves
    Plan,

    /// Show teardown order and what survives it
    DestroyPlan,

    /// List declared resources
    List,

    /// Run the stack checks, failing on any violation
    Validate,
}

fn load_config(cli: &Cli) -> Result<StackConfig> {
    match &cli.config {
        Some(path) => StackConfig::from_file(path)
            .wrap_err_with(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(match cli.variant {
            Variant::A => StackConfig::variant_a(),
            Variant::B => StackConfig::variant_b(),
        }),
    }
}

fn synthesize(cli: &Cli) -> Result<SynthesizedStack> {
    let config = load_config(cli)?;
    let target = DeployTarget::resolve(cli.account.clone(), cli.region.clone(), cli.deploy_env.clone())
        .wrap_err("Failed to resolve deploy target")?;
    build_stack(&config, &target).wrap_err("Failed to synthesize stack")
}

fn main() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();
    let stack = synthesize(&cli)?;

    match &cli.command {
        Commands::Synth { out } => {
            if out == "-" {
                println!("{}", serde_json::to_string_pretty(&stack.template())?);
            } else {
                let (template, assets) = stack.write_to(out)?;
                info!(
                    stack = %stack.stack_name(),
                    template = %template.display(),
                    assets = %assets.display(),
                    "Synthesis complete"
                );
            }
        }

        Commands::Diff { against } => {
            let raw = fs::read_to_string(against)
                .wrap_err_with(|| format!("Failed to read {}", against.display()))?;
            let previous: Value = serde_json::from_str(&raw)
                .wrap_err_with(|| format!("{} is not a JSON template", against.display()))?;
            let diff = diff_templates(&previous, &stack.template());
            print!("{}", diff);
            info!(
                added = diff.added(),
                removed = diff.removed(),
                modified = diff.modified(),
                "Diff complete"
            );
        }

        Commands::Plan => {
            for (index, wave) in stack.manifest.creation_waves().iter().enumerate() {
                println!("Wave {}", index + 1);
                for id in wave {
                    let resource = stack.manifest.resource(id)?;
                    println!("  {} ({})", id, resource.resource_type);
                }
            }
        }

        Commands::DestroyPlan => {
            for id in stack.manifest.deletion_order() {
                let resource = stack.manifest.resource(&id)?;
                let policy = resource
                    .removal_policy
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "Delete".to_string());
                println!("{:<10} {} ({})", policy, id, resource.resource_type);
            }
            let retained = stack.manifest.retained_on_teardown();
            if retained.is_empty() {
                println!("Nothing is retained after teardown");
            } else {
                println!("Retained after teardown:");
                for resource in retained {
                    println!("  {} ({})", resource.logical_id, resource.resource_type);
                }
            }
        }

        Commands::List => {
            for resource in stack.manifest.resources() {
                println!(
                    "{:<50} {:<50} {}",
                    resource.logical_id,
                    resource.resource_type,
                    resource.path.as_deref().unwrap_or("")
                );
            }
        }

        Commands::Validate => {
            let results = run_checks(&stack.manifest, stack.edge_target);
            for result in &results {
                let mark = if result.passed { "ok" } else { "FAIL" };
                println!("[{:>4}] {}: {}", mark, result.name, result.detail);
            }
            if !all_passed(&results) {
                bail!("Stack {} failed validation", stack.stack_name());
            }
        }
    }

    Ok(())
}
