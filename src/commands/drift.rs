//! `convoy drift [--fix]`
//!
//! Compare managed files on each host with the baseline recorded at apply
//! time. `--fix` restores ownership and mode; changed or missing content
//! needs `convoy rollout --force`, since the manifest itself is unchanged.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use serde::Serialize;

use convoy::config::Config;
use convoy::domain::host_state::{DriftResult, DriftStatus};
use convoy::domain::state_store::DriftFix;
use convoy::transport::SessionPool;

use super::HostFilter;

#[derive(Debug, Serialize)]
struct HostDrift {
    results: Vec<DriftResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    fixes: Vec<(String, DriftFix)>,
}

pub fn run(config: &Config, filter: &HostFilter, fix: bool, json: bool) -> Result<()> {
    let runtime = super::runtime()?;
    runtime.block_on(run_async(config, filter, fix, json))
}

async fn run_async(config: &Config, filter: &HostFilter, fix: bool, json: bool) -> Result<()> {
    let hosts = super::select_hosts(config, filter)?;
    let pool = super::ssh_pool(config, &hosts);
    let state = super::state_store(config);

    if !json {
        println!(
            "{} Checking drift on {} hosts{}",
            ">>".blue().bold(),
            hosts.len(),
            if fix { " (fixing permissions)" } else { "" }
        );
    }

    let results = super::for_each_host(&hosts, config.rollout.max_parallel, move |host| {
        let pool = pool.clone();
        let state = state.clone();
        async move {
            let session = pool.session(&host.target()).await?;
            let mut results = state.record_drift(session.as_ref()).await?;

            let mut fixes = Vec::new();
            if fix {
                for result in results.iter().filter(|r| r.drifted()) {
                    let outcome = state.fix_drift(session.as_ref(), result).await?;
                    fixes.push((result.path.clone(), outcome));
                }
                if fixes.iter().any(|(_, f)| *f == DriftFix::Restored) {
                    results = state.record_drift(session.as_ref()).await?;
                }
            }

            Ok(HostDrift { results, fixes })
        }
    })
    .await;

    let failures = results.iter().filter(|(_, r)| r.is_err()).count();

    if json {
        let report: Vec<serde_json::Value> = results
            .iter()
            .map(|(host, result)| match result {
                Ok(drift) => serde_json::json!({ "host": host, "drift": drift }),
                Err(e) => serde_json::json!({ "host": host, "error": e.to_string() }),
            })
            .collect();
        let body = serde_json::to_string_pretty(&report).context("serializing drift report")?;
        println!("{body}");
    } else {
        println!();
        for (host, result) in &results {
            print_host(host, result);
        }
        println!();
    }

    if failures > 0 {
        bail!("drift check failed on {failures} host(s)");
    }
    Ok(())
}

fn print_host(host: &str, result: &Result<HostDrift, convoy::error::FleetError>) {
    let drift = match result {
        Ok(drift) => drift,
        Err(e) => {
            println!("  {} {} — {}", "!!".red().bold(), host.bold(), e);
            return;
        }
    };

    let drifted: Vec<&DriftResult> = drift.results.iter().filter(|r| r.drifted()).collect();
    if drift.results.is_empty() {
        println!("  {} {} — no baseline recorded", "::".blue().bold(), host.bold());
        return;
    }
    if drifted.is_empty() {
        println!(
            "  {} {} — {} file(s) match",
            "ok".green().bold(),
            host.bold(),
            drift.results.len()
        );
    } else {
        println!(
            "  {} {} — {} of {} file(s) drifted",
            "!!".red().bold(),
            host.bold(),
            drifted.len(),
            drift.results.len()
        );
        for result in drifted {
            println!("     {} {}", status_label(result.status), result.path);
        }
    }

    for (path, fix) in &drift.fixes {
        match fix {
            DriftFix::Restored => println!("     {} {}", "restored".green(), path),
            DriftFix::RequiresReapply => {
                println!("     {} {} (run `convoy rollout --force`)", "needs apply".yellow(), path)
            }
            DriftFix::Unchanged => {}
        }
    }
}

fn status_label(status: DriftStatus) -> colored::ColoredString {
    match status {
        DriftStatus::Ok => "ok".green(),
        DriftStatus::Missing => "missing".red(),
        DriftStatus::ContentChanged => "content".red(),
        DriftStatus::PermissionsChanged => "perms".yellow(),
    }
}
