mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::{GlobalArgs, HostFilter};
use convoy::domain::health::FailurePolicy;
use convoy::domain::rollout::Strategy;

#[derive(Parser)]
#[command(
    name = "convoy",
    version,
    about = "Agentless rollout and reboot coordination for Ubuntu and NixOS fleets"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the rollout batches without touching any host
    Plan {
        #[command(flatten)]
        filter: HostFilter,

        /// Batching strategy: serial, parallel or canary (overrides config)
        #[arg(long)]
        strategy: Option<Strategy>,

        /// Share of the fleet in the canary batch (overrides config)
        #[arg(long)]
        canary_percent: Option<u32>,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Build, copy and activate the configuration across the fleet
    Rollout {
        #[command(flatten)]
        filter: HostFilter,

        /// Batching strategy: serial, parallel or canary (overrides config)
        #[arg(long)]
        strategy: Option<Strategy>,

        /// Share of the fleet in the canary batch (overrides config)
        #[arg(long)]
        canary_percent: Option<u32>,

        /// Hosts applied at once within a batch (overrides config)
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Build and compare, but do not copy or activate
        #[arg(long)]
        dry_run: bool,

        /// Apply even to hosts already on this manifest (repairs content drift)
        #[arg(long)]
        force: bool,

        /// Skip the connectivity, sudo, disk and nix checks before building
        #[arg(long)]
        skip_preflight: bool,

        /// On failed health checks: continue, halt or rollback (overrides config)
        #[arg(long)]
        on_health_failure: Option<FailurePolicy>,

        /// Reboot hosts that need it and whose policy allows it
        #[arg(long)]
        reboot: bool,

        /// Hosts rebooting at once across the fleet (overrides config)
        #[arg(long)]
        max_concurrent_reboots: Option<usize>,

        /// Write a checksummed JSON job record here
        #[arg(long)]
        report: Option<PathBuf>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compare managed files with the recorded baseline
    Drift {
        #[command(flatten)]
        filter: HostFilter,

        /// Restore ownership and mode of drifted files
        #[arg(long)]
        fix: bool,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check for or perform reboots
    Reboot {
        #[command(subcommand)]
        command: RebootCommands,
    },

    /// Summarise the recorded state of each host
    Status {
        #[command(flatten)]
        filter: HostFilter,

        /// Print states as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum RebootCommands {
    /// Report which hosts need a reboot
    Check {
        #[command(flatten)]
        filter: HostFilter,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reboot hosts that need it, honouring windows and the concurrency limit
    Run {
        #[command(flatten)]
        filter: HostFilter,

        /// Reboot even if no reboot is pending
        #[arg(long)]
        force: bool,

        /// Allow reboots regardless of host policy (windows still apply)
        #[arg(long)]
        allow: bool,

        /// Hosts rebooting at once (overrides config)
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = commands::setup(&cli.global)?;

    match cli.command {
        Commands::Plan {
            filter,
            strategy,
            canary_percent,
            json,
        } => commands::plan::run(&config, &filter, strategy, canary_percent, json),
        Commands::Rollout {
            filter,
            strategy,
            canary_percent,
            max_parallel,
            dry_run,
            force,
            skip_preflight,
            on_health_failure,
            reboot,
            max_concurrent_reboots,
            report,
            json,
        } => commands::rollout::run(
            &config,
            commands::rollout::RolloutArgs {
                filter,
                strategy,
                canary_percent,
                max_parallel,
                dry_run,
                force,
                skip_preflight,
                on_health_failure,
                reboot,
                max_concurrent_reboots,
                report,
                json,
            },
        ),
        Commands::Drift { filter, fix, json } => commands::drift::run(&config, &filter, fix, json),
        Commands::Reboot { command } => match command {
            RebootCommands::Check { filter, json } => commands::reboot::check(&config, &filter, json),
            RebootCommands::Run {
                filter,
                force,
                allow,
                max_concurrent,
                json,
            } => commands::reboot::run(
                &config,
                commands::reboot::RunArgs {
                    filter,
                    force,
                    allow,
                    max_concurrent,
                    json,
                },
            ),
        },
        Commands::Status { filter, json } => commands::status::run(&config, &filter, json),
    }
}
