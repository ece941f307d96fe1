//! `convoy plan`
//!
//! Show the batches a rollout would run, without contacting any host.

use anyhow::{Context, Result};
use colored::Colorize;

use convoy::config::Config;
use convoy::domain::rollout::{self, Strategy};

use super::HostFilter;

pub fn run(
    config: &Config,
    filter: &HostFilter,
    strategy: Option<Strategy>,
    canary_percent: Option<u32>,
    json: bool,
) -> Result<()> {
    let hosts = super::select_hosts(config, filter)?;
    let strategy = strategy.unwrap_or(config.rollout.strategy);
    let settings = config.rollout_settings().tightened_by(&hosts);
    let canary_percent = canary_percent.unwrap_or(settings.canary_percent);

    let batches = rollout::plan(&hosts, strategy, canary_percent);

    if json {
        let body = serde_json::to_string_pretty(&batches).context("serializing plan")?;
        println!("{body}");
        return Ok(());
    }

    println!(
        "{} {} hosts, strategy {}, {} batch(es)",
        "::".blue().bold(),
        hosts.len(),
        strategy.to_string().bold(),
        batches.len()
    );
    if strategy == Strategy::Canary {
        println!("   canary: {canary_percent}% of the fleet");
    }
    println!();

    for batch in &batches {
        let label = if batch.canary {
            format!("batch {} (canary)", batch.index).yellow().bold()
        } else {
            format!("batch {}", batch.index).bold()
        };
        println!("  {label}");
        for host in &batch.hosts {
            println!(
                "    - {} {} ({})",
                host.name,
                host.target().to_string().dimmed(),
                host.base
            );
        }
    }

    println!();
    Ok(())
}
