pub mod drift;
pub mod plan;
pub mod reboot;
pub mod rollout;
pub mod status;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Args;
use colored::Colorize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use convoy::config::{self, Config};
use convoy::domain::host::{BaseOs, Host};
use convoy::domain::state_store::StateStore;
use convoy::error::FleetError;
use convoy::inventory::{Inventory, Selector};
use convoy::logging::{self, LogFormat};
use convoy::transport::ssh::OpenSshPool;

/// Flags shared by every command.
#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Path to config file (default: ~/.config/convoy/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (overrides config; RUST_LOG wins over both)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log format: pretty or json (overrides config)
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Inventory file or directory (overrides config)
    #[arg(long, short = 'i', global = true)]
    pub inventory: Option<PathBuf>,
}

/// Host selection flags.
#[derive(Debug, Clone, Default, Args)]
pub struct HostFilter {
    /// Only hosts in this inventory group (children included)
    #[arg(long, short = 'g')]
    pub group: Option<String>,

    /// Only these hosts (repeatable)
    #[arg(long = "host", short = 'H')]
    pub hosts: Vec<String>,

    /// Only hosts with this base OS (ubuntu or nixos)
    #[arg(long)]
    pub base: Option<BaseOs>,
}

impl HostFilter {
    fn selector(&self) -> Selector {
        Selector {
            group: self.group.clone(),
            names: self.hosts.clone(),
            base: self.base,
        }
    }
}

/// Load configuration, apply CLI overrides and start logging.
pub fn setup(global: &GlobalArgs) -> Result<Config> {
    let mut config = config::load(global.config.as_deref())?;

    // CLI flags override config values
    if let Some(level) = &global.log_level {
        config.log_level = level.clone();
    }
    if let Some(format) = global.log_format {
        config.log_format = format;
    }
    if let Some(inventory) = &global.inventory {
        config.inventory = inventory.clone();
    }

    logging::init(&config.log_level, config.log_format);
    Ok(config)
}

pub(crate) fn select_hosts(config: &Config, filter: &HostFilter) -> Result<Vec<Host>> {
    let inventory = Inventory::load(&config.inventory)?;
    let hosts = inventory.select(&filter.selector())?;
    if hosts.is_empty() {
        bail!("no hosts matched the selection");
    }
    Ok(hosts)
}

/// Pool with each host's own key registered.
pub(crate) fn ssh_pool(config: &Config, hosts: &[Host]) -> Arc<OpenSshPool> {
    let mut pool = OpenSshPool::new(config.ssh.to_options());
    for host in hosts {
        if let Some(identity) = &host.identity_file {
            pool = pool.with_identity(host.target(), identity.clone());
        }
    }
    Arc::new(pool)
}

pub(crate) fn state_store(config: &Config) -> StateStore {
    StateStore::new(config.state_path.clone())
}

/// Build tokio runtime explicitly (no #[tokio::main] on fn main).
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

/// Cancel `token` on the first Ctrl-C. Must be called inside the runtime.
pub(crate) fn cancel_on_ctrl_c(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                eprintln!(
                    "{} Interrupted, letting in-flight hosts finish",
                    "!!".red().bold()
                );
                token.cancel();
            }
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C"),
        }
    });
}

/// Run `work` for every host, at most `max_parallel` at a time. Results come
/// back in host order; a host whose task panicked is reported as such.
pub(crate) async fn for_each_host<T, F, Fut>(
    hosts: &[Host],
    max_parallel: usize,
    work: F,
) -> Vec<(String, Result<T, FleetError>)>
where
    F: Fn(Host) -> Fut,
    Fut: Future<Output = Result<T, FleetError>> + Send + 'static,
    T: Send + 'static,
{
    let mut tasks = JoinSet::new();
    let mut pending = hosts.iter().enumerate();
    let mut done: Vec<(usize, Result<T, FleetError>)> = Vec::with_capacity(hosts.len());

    loop {
        while tasks.len() < max_parallel.max(1) {
            let Some((index, host)) = pending.next() else { break };
            let fut = work(host.clone());
            tasks.spawn(async move { (index, fut.await) });
        }
        match tasks.join_next().await {
            None => break,
            Some(Ok(result)) => done.push(result),
            Some(Err(e)) => error!(error = %e, "host task did not complete"),
        }
    }

    let mut slots: Vec<Option<Result<T, FleetError>>> = hosts.iter().map(|_| None).collect();
    for (index, result) in done {
        slots[index] = Some(result);
    }
    hosts
        .iter()
        .zip(slots)
        .map(|(host, slot)| {
            let result = slot.unwrap_or_else(|| {
                Err(FleetError::State {
                    host: host.name.clone(),
                    reason: "host task panicked".to_string(),
                })
            });
            (host.name.clone(), result)
        })
        .collect()
}
