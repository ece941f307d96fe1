//! `convoy reboot check` / `convoy reboot run`
//!
//! Check hosts for a pending reboot, or reboot them one limiter slot at a
//! time inside their maintenance windows.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use convoy::config::Config;
use convoy::domain::limiter::ConcurrencyLimiter;
use convoy::domain::reboot::{check_reboot_required, RebootOrchestrator, RebootReport, RebootStatus};
use convoy::error::FleetError;
use convoy::transport::SessionPool;

use super::HostFilter;

pub fn check(config: &Config, filter: &HostFilter, json: bool) -> Result<()> {
    let runtime = super::runtime()?;
    runtime.block_on(check_async(config, filter, json))
}

async fn check_async(config: &Config, filter: &HostFilter, json: bool) -> Result<()> {
    let hosts = super::select_hosts(config, filter)?;
    let pool = super::ssh_pool(config, &hosts);
    let state = super::state_store(config);

    let results = super::for_each_host(&hosts, config.rollout.max_parallel, move |host| {
        let pool = pool.clone();
        let state = state.clone();
        async move {
            let session = pool.session(&host.target()).await?;
            let status = check_reboot_required(session.as_ref(), host.base).await?;
            if let Err(e) = state.update_reboot_status(session.as_ref(), &status).await {
                warn!(host = %host.name, error = %e, "could not record reboot status");
            }
            Ok(status)
        }
    })
    .await;

    let failures = results.iter().filter(|(_, r)| r.is_err()).count();

    if json {
        let report: Vec<serde_json::Value> = results
            .iter()
            .map(|(host, result)| match result {
                Ok(status) => serde_json::json!({ "host": host, "status": status }),
                Err(e) => serde_json::json!({ "host": host, "error": e.to_string() }),
            })
            .collect();
        let body = serde_json::to_string_pretty(&report).context("serializing reboot status")?;
        println!("{body}");
    } else {
        println!("{}", "Reboot Status".bold());
        println!();
        for (host, result) in &results {
            print_status(host, result);
        }
        println!();
    }

    if failures > 0 {
        bail!("reboot check failed on {failures} host(s)");
    }
    Ok(())
}

fn print_status(host: &str, result: &Result<RebootStatus, FleetError>) {
    match result {
        Ok(status) if status.required => {
            println!("  {} {} — reboot required: {}", "!!".yellow().bold(), host.bold(), status.reason);
            if !status.trigger_packages.is_empty() {
                println!("     packages: {}", status.trigger_packages.join(", "));
            }
        }
        Ok(_) => println!("  {} {} — no reboot needed", "ok".green().bold(), host.bold()),
        Err(e) => println!("  {} {} — {}", "!!".red().bold(), host.bold(), e),
    }
}

pub struct RunArgs {
    pub filter: HostFilter,
    /// Reboot even when no reboot is pending.
    pub force: bool,
    /// Allow reboots for hosts whose policy does not.
    pub allow: bool,
    pub max_concurrent: Option<usize>,
    pub json: bool,
}

#[derive(Debug)]
enum RebootRun {
    NotRequired,
    Rebooted(RebootReport),
}

pub fn run(config: &Config, args: RunArgs) -> Result<()> {
    let runtime = super::runtime()?;
    runtime.block_on(run_async(config, args))
}

async fn run_async(config: &Config, args: RunArgs) -> Result<()> {
    let hosts = super::select_hosts(config, &args.filter)?;
    let pool = super::ssh_pool(config, &hosts);

    let mut reboot_config = config.reboot.to_reboot_config();
    if args.allow {
        reboot_config.allow = true;
    }
    if let Some(max) = args.max_concurrent {
        reboot_config.max_concurrent = max.max(1);
    }

    let limiter = ConcurrencyLimiter::new(reboot_config.max_concurrent);
    let orchestrator = Arc::new(
        RebootOrchestrator::new(reboot_config, pool.clone())
            .with_state_store(super::state_store(config)),
    );

    if !args.json {
        println!(
            "{} Rebooting up to {} hosts, {} at a time",
            ">>".blue().bold(),
            hosts.len(),
            limiter.max()
        );
    }

    let cancel = CancellationToken::new();
    super::cancel_on_ctrl_c(&cancel);

    let force = args.force;
    let task_cancel = cancel.clone();
    // Every host may be checked at once; the limiter bounds the reboots themselves.
    let results = super::for_each_host(&hosts, hosts.len(), move |host| {
        let pool = pool.clone();
        let orchestrator = orchestrator.clone();
        let limiter = limiter.clone();
        let cancel = task_cancel.clone();
        async move {
            if !force {
                let session = pool.session(&host.target()).await?;
                let status = check_reboot_required(session.as_ref(), host.base).await?;
                if !status.required {
                    return Ok(RebootRun::NotRequired);
                }
            }

            let permit = limiter.acquire(&cancel).await?;
            let report = orchestrator.execute_reboot(&host, &cancel).await;
            permit.release();
            Ok(RebootRun::Rebooted(report))
        }
    })
    .await;

    let mut failures = 0;
    let mut json_rows = Vec::new();
    if !args.json {
        println!();
    }

    for (host, result) in &results {
        let failed = match result {
            Ok(RebootRun::Rebooted(report)) => !report.succeeded() && !report.refused(),
            Ok(RebootRun::NotRequired) => false,
            Err(_) => true,
        };
        if failed {
            failures += 1;
        }

        if args.json {
            json_rows.push(match result {
                Ok(RebootRun::NotRequired) => {
                    serde_json::json!({ "host": host, "result": "not_required" })
                }
                Ok(RebootRun::Rebooted(report)) => {
                    serde_json::json!({ "host": host, "result": "attempted", "report": report })
                }
                Err(e) => serde_json::json!({ "host": host, "error": e.to_string() }),
            });
        } else {
            print_run(host, result);
        }
    }

    if args.json {
        let body = serde_json::to_string_pretty(&json_rows).context("serializing reboot report")?;
        println!("{body}");
    } else {
        println!();
    }

    if failures > 0 {
        bail!("reboot failed on {failures} host(s)");
    }
    if cancel.is_cancelled() {
        bail!("reboot run cancelled");
    }
    Ok(())
}

fn print_run(host: &str, result: &Result<RebootRun, FleetError>) {
    match result {
        Ok(RebootRun::NotRequired) => {
            println!("  {} {} — no reboot needed", "::".blue().bold(), host.bold())
        }
        Ok(RebootRun::Rebooted(report)) if report.succeeded() => println!(
            "  {} {} — back after {:.1?}",
            "ok".green().bold(),
            host.bold(),
            report.elapsed
        ),
        Ok(RebootRun::Rebooted(report)) if report.refused() => println!(
            "  {} {} — deferred: {}",
            "::".yellow().bold(),
            host.bold(),
            report.error.as_deref().unwrap_or("policy")
        ),
        Ok(RebootRun::Rebooted(report)) => println!(
            "  {} {} — {}",
            "!!".red().bold(),
            host.bold(),
            report.error.as_deref().unwrap_or("reboot failed")
        ),
        Err(e) => println!("  {} {} — {}", "!!".red().bold(), host.bold(), e),
    }
}
