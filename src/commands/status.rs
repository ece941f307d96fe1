//! `convoy status`
//!
//! Read the state document from each host and summarise it.

use anyhow::{bail, Context, Result};
use colored::Colorize;

use convoy::config::Config;
use convoy::domain::host_state::HostState;
use convoy::error::FleetError;
use convoy::transport::SessionPool;

use super::HostFilter;

pub fn run(config: &Config, filter: &HostFilter, json: bool) -> Result<()> {
    let runtime = super::runtime()?;
    runtime.block_on(run_async(config, filter, json))
}

async fn run_async(config: &Config, filter: &HostFilter, json: bool) -> Result<()> {
    let hosts = super::select_hosts(config, filter)?;
    let pool = super::ssh_pool(config, &hosts);
    let state = super::state_store(config);

    let results = super::for_each_host(&hosts, config.rollout.max_parallel, move |host| {
        let pool = pool.clone();
        let state = state.clone();
        async move {
            let session = pool.session(&host.target()).await?;
            state.read_state(session.as_ref()).await
        }
    })
    .await;

    let unreachable = results.iter().filter(|(_, r)| r.is_err()).count();

    if json {
        let report: Vec<serde_json::Value> = results
            .iter()
            .map(|(host, result)| match result {
                Ok(state) => serde_json::json!({ "host": host, "state": state }),
                Err(e) => serde_json::json!({ "host": host, "error": e.to_string() }),
            })
            .collect();
        let body = serde_json::to_string_pretty(&report).context("serializing host states")?;
        println!("{body}");
    } else {
        println!("{}", "Fleet Status".bold());
        println!();
        for (host, result) in &results {
            print_host(host, result);
        }
        println!();
    }

    if unreachable > 0 {
        bail!("{unreachable} host(s) could not be read");
    }
    Ok(())
}

fn print_host(host: &str, result: &Result<HostState, FleetError>) {
    match result {
        Ok(state) => {
            let icon = if state.drift_detected || state.reboot_required {
                "!!".yellow().bold()
            } else if state.manifest_hash.is_empty() {
                "::".blue().bold()
            } else {
                "ok".green().bold()
            };
            println!("  {} {} — {}", icon, host.bold(), state.summary());
        }
        Err(e) => println!("  {} {} — {}", "!!".red().bold(), host.bold(), e),
    }
}
