//! Layered configuration: defaults, then `config.yaml`, then `CONVOY_*`
//! environment variables. CLI flags override the result in `commands/`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::domain::health::{FailurePolicy, HealthCheck};
use crate::domain::pipeline::{default_health_checks, PipelineConfig};
use crate::domain::preflight::PreflightConfig;
use crate::domain::reboot::RebootConfig;
use crate::domain::rollout::{RolloutSettings, Strategy};
use crate::domain::state_store::DEFAULT_STATE_PATH;
use crate::domain::window::RebootWindow;
use crate::logging::LogFormat;
use crate::transport::ssh::SshOptions;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub inventory: PathBuf,
    pub flake: String,
    pub state_path: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub rollout: RolloutSection,
    pub reboot: RebootSection,
    pub ssh: SshSection,
    pub preflight: PreflightConfig,
    pub health: HealthSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inventory: PathBuf::from("inventory.yaml"),
            flake: ".".to_string(),
            state_path: DEFAULT_STATE_PATH.to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            rollout: RolloutSection::default(),
            reboot: RebootSection::default(),
            ssh: SshSection::default(),
            preflight: PreflightConfig::default(),
            health: HealthSection::default(),
        }
    }
}

// ── Sections ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutSection {
    pub strategy: Strategy,
    pub canary_percent: u32,
    pub max_parallel: usize,
    pub pause_between_batches_secs: u64,
}

impl Default for RolloutSection {
    fn default() -> Self {
        Self {
            strategy: Strategy::Canary,
            canary_percent: 10,
            max_parallel: 5,
            pause_between_batches_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebootSection {
    pub allow: bool,
    pub window: Option<RebootWindow>,
    pub max_concurrent: usize,
    pub pre_hook: Option<String>,
    pub post_hook: Option<String>,
    pub wait_timeout_secs: u64,
    pub wait_interval_secs: u64,
    pub settle_delay_secs: u64,
    pub command: String,
    pub await_shutdown: bool,
}

impl Default for RebootSection {
    fn default() -> Self {
        let defaults = RebootConfig::default();
        Self {
            allow: defaults.allow,
            window: defaults.window,
            max_concurrent: defaults.max_concurrent,
            pre_hook: None,
            post_hook: None,
            wait_timeout_secs: defaults.wait_timeout.as_secs(),
            wait_interval_secs: defaults.wait_interval.as_secs(),
            settle_delay_secs: defaults.settle_delay.as_secs(),
            command: defaults.reboot_command,
            await_shutdown: defaults.await_shutdown,
        }
    }
}

impl RebootSection {
    pub fn to_reboot_config(&self) -> RebootConfig {
        RebootConfig {
            allow: self.allow,
            window: self.window,
            max_concurrent: self.max_concurrent.max(1),
            pre_hook: self.pre_hook.clone().filter(|h| !h.trim().is_empty()),
            post_hook: self.post_hook.clone().filter(|h| !h.trim().is_empty()),
            wait_timeout: Duration::from_secs(self.wait_timeout_secs),
            wait_interval: Duration::from_secs(self.wait_interval_secs.max(1)),
            settle_delay: Duration::from_secs(self.settle_delay_secs),
            reboot_command: self.command.clone(),
            await_shutdown: self.await_shutdown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSection {
    pub connect_timeout_secs: u64,
    pub control_dir: Option<PathBuf>,
    pub persist_secs: u64,
    pub identity_file: Option<PathBuf>,
    pub strict_host_keys: bool,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            control_dir: None,
            persist_secs: 60,
            identity_file: None,
            strict_host_keys: false,
        }
    }
}

impl SshSection {
    pub fn to_options(&self) -> SshOptions {
        let defaults = SshOptions::default();
        SshOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            control_dir: self.control_dir.clone().unwrap_or(defaults.control_dir),
            control_persist: Duration::from_secs(self.persist_secs),
            identity_file: self.identity_file.clone(),
            strict_host_keys: self.strict_host_keys,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub skip: bool,
    pub delay_secs: u64,
    pub checks: Vec<HealthCheck>,
    /// What a failed check does to the host: continue, halt or rollback.
    pub on_failure: FailurePolicy,
}

impl Default for HealthSection {
    fn default() -> Self {
        let defaults = PipelineConfig::default();
        Self {
            skip: defaults.skip_health_checks,
            delay_secs: defaults.health_check_delay.as_secs(),
            checks: default_health_checks(),
            on_failure: defaults.health_policy,
        }
    }
}

impl Config {
    /// `~/.config/convoy/config.yaml`, or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("convoy").join("config.yaml"))
    }

    pub fn pipeline_config(&self, dry_run: bool, force: bool) -> PipelineConfig {
        PipelineConfig {
            dry_run,
            force,
            preflight: self.preflight.clone(),
            skip_health_checks: self.health.skip,
            health_check_delay: Duration::from_secs(self.health.delay_secs),
            health_checks: self.health.checks.clone(),
            health_policy: self.health.on_failure,
        }
    }

    /// Fleet rollout settings before any host policy tightens them.
    pub fn rollout_settings(&self) -> RolloutSettings {
        RolloutSettings {
            canary_percent: self.rollout.canary_percent,
            max_parallel: self.rollout.max_parallel.max(1),
            pause_between_batches: Duration::from_secs(self.rollout.pause_between_batches_secs),
            max_concurrent_reboots: self.reboot.max_concurrent.max(1),
        }
    }
}

/// Load configuration. An explicit path must exist; the default path is
/// optional.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    match explicit {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("config file {} does not exist", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }
        None => {
            if let Some(path) = Config::default_path().filter(|p| p.exists()) {
                figment = figment.merge(Yaml::file(path));
            }
        }
    }

    figment
        .merge(Env::prefixed("CONVOY_").split("__"))
        .extract()
        .context("loading convoy configuration")
}
