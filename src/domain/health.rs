//! Post-activation health checks.
//!
//! Checks run on the host itself over the pooled session: systemd unit
//! state, an HTTP status via `curl`, a TCP connect via bash's `/dev/tcp`, or
//! an arbitrary command. Each check retries on its own schedule.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::host::BaseOs;
use super::reboot::sleep_or_cancel;
use crate::error::{FleetError, FleetResult};
use crate::transport::RemoteSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Systemd,
    Http,
    Tcp,
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CheckKind,
    /// Unit name, URL, `host:port` or shell command, depending on `kind`.
    pub target: String,
    /// HTTP only; 200 when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_status: Option<u16>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_retries() -> u32 {
    1
}

fn default_retry_delay_secs() -> u64 {
    2
}

impl HealthCheck {
    pub fn command(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: CheckKind::Command,
            target: command.to_string(),
            expected_status: None,
            timeout_secs: 5,
            retries: default_retries(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }

    /// The remote command for one attempt, or why there is none.
    pub fn remote_command(&self) -> Result<String, String> {
        let timeout = self.timeout_secs.max(1);
        let target = shell_words::quote(&self.target);
        match self.kind {
            CheckKind::Systemd => Ok(format!("systemctl is-active {target}")),
            CheckKind::Http => Ok(format!(
                "curl -s -o /dev/null -w '%{{http_code}}' --max-time {timeout} {target}"
            )),
            CheckKind::Tcp => {
                let (host, port) = split_host_port(&self.target)?;
                let connect = format!("cat < /dev/null > /dev/tcp/{host}/{port}");
                Ok(format!(
                    "timeout {timeout} bash -c {} 2>&1 && echo ok || echo failed",
                    shell_words::quote(&connect)
                ))
            }
            CheckKind::Command => Ok(format!("timeout {timeout} sh -c {target}")),
        }
    }
}

fn split_host_port(target: &str) -> Result<(&str, u16), String> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| format!("expected host:port, got {target:?}"))?;
    let valid_host = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !valid_host {
        return Err(format!("invalid host in {target:?}"));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| format!("invalid port in {target:?}"))?;
    Ok((host, port))
}

/// What a failed health check does to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Switch back to the previous generation and fail the host.
    Rollback,
    /// Leave the new configuration active and fail the host.
    Halt,
    /// Report the failure as a warning; the host still counts as applied.
    #[default]
    Continue,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rollback" => Ok(FailurePolicy::Rollback),
            "halt" => Ok(FailurePolicy::Halt),
            "continue" => Ok(FailurePolicy::Continue),
            _ => Err(format!(
                "unknown health failure policy: {s} (expected rollback, halt or continue)"
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Rollback => write!(f, "rollback"),
            FailurePolicy::Halt => write!(f, "halt"),
            FailurePolicy::Continue => write!(f, "continue"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResult {
    pub name: String,
    pub kind: CheckKind,
    pub passed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
    pub attempts: u32,
    pub latency: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub checks: Vec<HealthResult>,
}

impl HealthReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn summary(&self) -> String {
        let passed = self.checks.iter().filter(|c| c.passed).count();
        let failed: Vec<&str> = self
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name.as_str())
            .collect();
        if failed.is_empty() {
            format!("{passed}/{} health checks passed", self.checks.len())
        } else {
            format!(
                "{passed}/{} health checks passed, failed: {}",
                self.checks.len(),
                failed.join(", ")
            )
        }
    }
}

/// Run `checks` in order. Only cancellation is an error; transport problems
/// fail the check that hit them.
pub async fn run_checks(
    session: &dyn RemoteSession,
    checks: &[HealthCheck],
    cancel: &CancellationToken,
) -> FleetResult<HealthReport> {
    let mut report = HealthReport::default();

    for check in checks {
        let retries = check.retries.max(1);
        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            let mut result = run_once(session, check).await;
            result.attempts = attempt;
            if result.passed || attempt >= retries {
                if !result.passed && retries > 1 {
                    result.details = format!("failed after {retries} attempts. {}", result.details);
                }
                break result;
            }
            debug!(check = %check.name, attempt, "health check failed, retrying");
            sleep_or_cancel(Duration::from_secs(check.retry_delay_secs), cancel).await?;
        };
        report.checks.push(result);
    }

    Ok(report)
}

async fn run_once(session: &dyn RemoteSession, check: &HealthCheck) -> HealthResult {
    let started = Instant::now();
    let mut result = HealthResult {
        name: check.name.clone(),
        kind: check.kind,
        passed: false,
        message: String::new(),
        details: String::new(),
        attempts: 0,
        latency: Duration::ZERO,
    };

    let command = match check.remote_command() {
        Ok(command) => command,
        Err(reason) => {
            result.message = reason;
            return result;
        }
    };

    let out = match session.exec(&command).await {
        Ok(out) => out,
        Err(e) => {
            result.latency = started.elapsed();
            result.message = format!("{} check could not run", check.target);
            result.details = e.to_string();
            return result;
        }
    };
    result.latency = started.elapsed();

    let stdout = out.stdout.trim();
    match check.kind {
        CheckKind::Systemd => {
            if stdout == "active" {
                result.passed = true;
                result.message = format!("unit {} is active", check.target);
            } else {
                result.message = format!("unit {} is not active", check.target);
                result.details = format!("status: {stdout}");
                let status = format!(
                    "systemctl status {} --no-pager -l 2>&1 | head -20",
                    shell_words::quote(&check.target)
                );
                if let Ok(detail) = session.exec(&status).await {
                    if !detail.stdout.trim().is_empty() {
                        result.details = detail.stdout.trim().to_string();
                    }
                }
            }
        }
        CheckKind::Http => {
            let expected = check.expected_status.unwrap_or(200);
            if !out.success() || stdout.is_empty() {
                result.message = format!("request to {} failed", check.target);
                result.details = format!("curl exit {}: {}", out.exit_code, out.stderr.trim());
            } else if stdout != expected.to_string() {
                result.message = format!("{} returned an unexpected status", check.target);
                result.details = format!("expected {expected}, got {stdout}");
            } else {
                result.passed = true;
                result.message = format!("{} returned {stdout}", check.target);
            }
        }
        CheckKind::Tcp => {
            if stdout.lines().last() == Some("ok") {
                result.passed = true;
                result.message = format!("connected to {}", check.target);
            } else {
                result.message = format!("cannot connect to {}", check.target);
                result.details = stdout.to_string();
            }
        }
        CheckKind::Command => {
            if out.success() {
                result.passed = true;
                result.message = "command succeeded".to_string();
                result.details = stdout.to_string();
            } else {
                result.message = format!("command exited with status {}", out.exit_code);
                result.details = [stdout, out.stderr.trim()]
                    .iter()
                    .filter(|s| !s.is_empty())
                    .copied()
                    .collect::<Vec<_>>()
                    .join("\n");
            }
        }
    }

    result
}

/// Switch the profile back one generation and activate it.
pub fn rollback_command(base: BaseOs) -> Option<String> {
    match base {
        BaseOs::Nixos => Some(
            "nix-env -p /nix/var/nix/profiles/system --rollback && \
             /nix/var/nix/profiles/system/bin/switch-to-configuration switch"
                .to_string(),
        ),
        BaseOs::Ubuntu => Some(
            "nix-env -p /nix/var/nix/profiles/convoy/system --rollback && \
             /nix/var/nix/profiles/convoy/system/activate"
                .to_string(),
        ),
        BaseOs::Unknown => None,
    }
}

/// Switch `host` back to its previous generation.
pub async fn roll_back(session: &dyn RemoteSession, host: &str, base: BaseOs) -> FleetResult<()> {
    let command = rollback_command(base).ok_or_else(|| FleetError::Activation {
        host: host.to_string(),
        reason: format!("no rollback for base '{base}'"),
    })?;

    let out = session.exec_sudo(&command).await?;
    if !out.success() {
        return Err(FleetError::Command {
            host: host.to_string(),
            command,
            exit_code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        });
    }
    Ok(())
}
