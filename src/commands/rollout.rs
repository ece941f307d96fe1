//! `convoy rollout`
//!
//! Build, copy and activate the new configuration across the selected hosts,
//! batch by batch, rebooting where required and allowed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use convoy::config::Config;
use convoy::domain::jobs::{JobKind, JobTracker};
use convoy::domain::limiter::ConcurrencyLimiter;
use convoy::domain::health::FailurePolicy;
use convoy::domain::pipeline::{ApplyPipeline, HostDisposition, HostOutcome};
use convoy::domain::reboot::RebootOrchestrator;
use convoy::domain::rollout::{self, RolloutExecutor, RolloutOptions, RolloutOutcome, Strategy};
use convoy::nix::{Builder, NixStore, Transfer};

use super::HostFilter;

pub struct RolloutArgs {
    pub filter: HostFilter,
    pub strategy: Option<Strategy>,
    pub canary_percent: Option<u32>,
    pub max_parallel: Option<usize>,
    pub dry_run: bool,
    pub force: bool,
    pub skip_preflight: bool,
    pub on_health_failure: Option<FailurePolicy>,
    pub reboot: bool,
    pub max_concurrent_reboots: Option<usize>,
    pub report: Option<PathBuf>,
    pub json: bool,
}

pub fn run(config: &Config, args: RolloutArgs) -> Result<()> {
    let runtime = super::runtime()?;
    runtime.block_on(run_async(config, args))
}

async fn run_async(config: &Config, args: RolloutArgs) -> Result<()> {
    let hosts = super::select_hosts(config, &args.filter)?;
    let strategy = args.strategy.unwrap_or(config.rollout.strategy);

    // Host policies tighten the config; explicit flags win over both.
    let mut settings = config.rollout_settings().tightened_by(&hosts);
    if let Some(percent) = args.canary_percent {
        settings.canary_percent = percent;
    }
    if let Some(max) = args.max_parallel {
        settings.max_parallel = max.max(1);
    }
    if let Some(max) = args.max_concurrent_reboots {
        settings.max_concurrent_reboots = max.max(1);
    }

    let mut reboot_config = config.reboot.to_reboot_config();
    reboot_config.max_concurrent = settings.max_concurrent_reboots;

    let mut pipeline_config = config.pipeline_config(args.dry_run, args.force);
    if args.skip_preflight {
        pipeline_config.preflight.skip = true;
    }
    if let Some(policy) = args.on_health_failure {
        pipeline_config.health_policy = policy;
    }

    let nix = Arc::new(
        NixStore::detect(config.flake.clone())
            .context("locating nix")?
            .with_ssh_identity(config.ssh.identity_file.clone()),
    );
    let builder: Arc<dyn Builder> = nix.clone();
    let transfer: Arc<dyn Transfer> = nix;

    let pool = super::ssh_pool(config, &hosts);
    let state = super::state_store(config);
    let pipeline = Arc::new(ApplyPipeline::new(
        pipeline_config,
        pool.clone(),
        builder,
        transfer,
        state.clone(),
    ));

    let limiter = ConcurrencyLimiter::new(reboot_config.max_concurrent);
    let orchestrator = Arc::new(RebootOrchestrator::new(reboot_config, pool).with_state_store(state));

    let options = RolloutOptions {
        max_parallel: settings.max_parallel,
        pause_between_batches: settings.pause_between_batches,
        reboot: args.reboot && !args.dry_run,
    };
    let executor = RolloutExecutor::new(pipeline, limiter, options).with_reboots(orchestrator);

    let batches = rollout::plan(&hosts, strategy, settings.canary_percent);
    println!(
        "{} Rolling out to {} hosts in {} batch(es) ({}{}{})",
        ">>".blue().bold(),
        hosts.len(),
        batches.len(),
        strategy,
        if args.dry_run { ", dry run" } else { "" },
        if args.force { ", forced" } else { "" }
    );

    let jobs = JobTracker::new();
    let job = jobs.create(JobKind::Rollout, None).await;
    jobs.start(&job).await;

    let cancel = CancellationToken::new();
    super::cancel_on_ctrl_c(&cancel);

    let outcome = executor.run(batches, &cancel).await;
    info!(job = %job, clean = outcome.is_clean(), "rollout finished");

    match serde_json::to_value(&outcome) {
        Ok(value) if outcome.is_clean() => {
            jobs.complete(&job, value).await;
        }
        Ok(_) => {
            jobs.fail(&job, summary_line(&outcome)).await;
        }
        Err(e) => {
            jobs.fail(&job, format!("serializing rollout outcome: {e}")).await;
        }
    }

    if let Some(path) = &args.report {
        jobs.persist(path)
            .await
            .with_context(|| format!("writing rollout report to {}", path.display()))?;
    }

    if args.json {
        let body = serde_json::to_string_pretty(&outcome).context("serializing rollout outcome")?;
        println!("{body}");
    } else {
        print_outcome(&outcome);
    }

    if let Some(path) = &args.report {
        println!("{} Report written to {}", "::".blue().bold(), path.display());
    }

    if !outcome.is_clean() {
        bail!("{}", summary_line(&outcome));
    }
    Ok(())
}

fn summary_line(outcome: &RolloutOutcome) -> String {
    let report = outcome.report();
    match outcome {
        RolloutOutcome::Completed(_) => format!(
            "rollout completed: {} succeeded, {} failed",
            report.succeeded, report.failed
        ),
        RolloutOutcome::CanaryBatchFailed { failed, .. } => format!(
            "canary batch failed on {}; {} host(s) not attempted",
            failed.join(", "),
            report.skipped.len()
        ),
        RolloutOutcome::Cancelled(_) => format!(
            "rollout cancelled: {} succeeded, {} failed, {} not attempted",
            report.succeeded,
            report.failed,
            report.skipped.len()
        ),
    }
}

fn print_outcome(outcome: &RolloutOutcome) {
    let report = outcome.report();
    println!();

    for host in &report.hosts {
        print_host(host);
    }
    for name in &report.skipped {
        println!("  {} {} — not attempted", "--".dimmed(), name.dimmed());
    }

    println!();
    let marker = if outcome.is_clean() {
        "ok".green().bold()
    } else {
        "!!".red().bold()
    };
    println!("{} {}", marker, summary_line(outcome));
}

fn print_host(host: &HostOutcome) {
    let (marker, text) = match host.disposition {
        HostDisposition::Applied => ("ok".green().bold(), "applied".to_string()),
        HostDisposition::UpToDate => ("ok".green().bold(), "up to date".to_string()),
        HostDisposition::DryRun => ("::".blue().bold(), "would apply".to_string()),
        HostDisposition::Failed => (
            "!!".red().bold(),
            host.error.clone().unwrap_or_else(|| "failed".to_string()),
        ),
    };
    println!(
        "  {} {} — {} ({:.1?})",
        marker,
        host.host.bold(),
        text,
        host.elapsed
    );

    if let Some(reboot) = &host.reboot {
        if reboot.succeeded() {
            println!("     rebooted in {:.1?}", reboot.elapsed);
        }
    } else if host.needs_reboot() {
        println!("     {}", "reboot required".yellow());
    }
    for warning in &host.warnings {
        println!("     {} {}", "warning:".yellow(), warning);
    }
}
