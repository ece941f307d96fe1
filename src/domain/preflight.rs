//! Checks a host must pass before anything is built for it or copied to it.
//!
//! Every host gets connectivity, passwordless sudo and free space on `/nix`
//! and `/var`. Ubuntu hosts also need a running nix daemon; NixOS hosts a
//! store that verifies cleanly.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::host::BaseOs;
use crate::error::{FleetError, FleetResult};
use crate::transport::RemoteSession;

const PING_TOKEN: &str = "convoy-preflight-ok";
const KIB_PER_GIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreflightConfig {
    pub skip: bool,
    pub min_free_nix_gb: u64,
    pub min_free_var_gb: u64,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            skip: false,
            min_free_nix_gb: 5,
            min_free_var_gb: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
    /// The command whose result decided the check.
    #[serde(skip)]
    pub command: String,
    #[serde(skip)]
    pub exit_code: i32,
}

impl CheckResult {
    fn pass(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            message: message.into(),
            details: String::new(),
            command: String::new(),
            exit_code: 0,
        }
    }

    fn fail(name: &'static str, command: &str, exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            message: message.into(),
            details: String::new(),
            command: command.to_string(),
            exit_code,
        }
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn summary(&self) -> String {
        let passed = self.checks.iter().filter(|c| c.passed).count();
        format!("{passed}/{} checks passed", self.checks.len())
    }

    /// The first failed check as a command failure for `host`.
    pub fn into_result(self, host: &str) -> FleetResult<Self> {
        let Some(failed) = self.checks.iter().find(|c| !c.passed) else {
            return Ok(self);
        };
        let stderr = if failed.details.is_empty() {
            format!("{}: {}", failed.name, failed.message)
        } else {
            format!("{}: {} ({})", failed.name, failed.message, failed.details)
        };
        Err(FleetError::Command {
            host: host.to_string(),
            command: failed.command.clone(),
            exit_code: failed.exit_code,
            stderr,
        })
    }
}

/// Run every check that applies to `base`. Transport failures end the run
/// early as errors; anything else is a failed check in the report.
pub async fn run_preflight(
    session: &dyn RemoteSession,
    base: BaseOs,
    config: &PreflightConfig,
) -> FleetResult<PreflightReport> {
    let mut report = PreflightReport::default();

    report.checks.push(check_connectivity(session).await?);
    report.checks.push(check_sudo(session).await?);
    report
        .checks
        .push(check_disk(session, "/nix", "disk_space_nix", config.min_free_nix_gb).await?);
    report
        .checks
        .push(check_disk(session, "/var", "disk_space_var", config.min_free_var_gb).await?);

    match base {
        BaseOs::Ubuntu => report.checks.push(check_nix_daemon(session).await?),
        BaseOs::Nixos => report.checks.push(check_nix_store(session).await?),
        BaseOs::Unknown => {}
    }

    if report.passed() {
        debug!(host = %session.target().addr, summary = %report.summary(), "preflight passed");
    } else {
        warn!(host = %session.target().addr, summary = %report.summary(), "preflight failed");
    }
    Ok(report)
}

async fn check_connectivity(session: &dyn RemoteSession) -> FleetResult<CheckResult> {
    const NAME: &str = "ssh_connectivity";
    let command = format!("echo {PING_TOKEN}");
    let out = session.exec(&command).await?;

    if !out.success() || !out.stdout.contains(PING_TOKEN) {
        return Ok(CheckResult::fail(NAME, &command, out.exit_code, "remote shell did not answer")
            .with_details(out.stderr.trim()));
    }
    Ok(CheckResult::pass(NAME, "ssh connection established"))
}

async fn check_sudo(session: &dyn RemoteSession) -> FleetResult<CheckResult> {
    const NAME: &str = "sudo_permissions";
    let command = "sudo -n true";
    let out = session.exec(command).await?;

    if !out.success() {
        return Ok(CheckResult::fail(NAME, command, out.exit_code, "passwordless sudo not available")
            .with_details("configure NOPASSWD for this user in sudoers"));
    }
    Ok(CheckResult::pass(NAME, "passwordless sudo available"))
}

async fn check_disk(
    session: &dyn RemoteSession,
    path: &str,
    name: &'static str,
    min_gb: u64,
) -> FleetResult<CheckResult> {
    let command = disk_command(path);
    let out = session.exec(&command).await?;

    if !out.success() {
        return Ok(CheckResult::fail(name, &command, out.exit_code, format!("{path} not accessible"))
            .with_details(out.stderr.trim()));
    }

    let raw = out.stdout.trim();
    let Ok(available_kib) = raw.parse::<u64>() else {
        return Ok(CheckResult::fail(name, &command, out.exit_code, format!("cannot read free space on {path}"))
            .with_details(format!("got {raw:?}")));
    };

    let available_gb = available_kib / KIB_PER_GIB;
    if available_kib < min_gb * KIB_PER_GIB {
        return Ok(CheckResult::fail(name, &command, out.exit_code, format!("insufficient disk space on {path}"))
            .with_details(format!("available {available_gb}GB, required {min_gb}GB")));
    }
    Ok(CheckResult::pass(name, format!("{path} has {available_gb}GB available")))
}

fn disk_command(path: &str) -> String {
    format!(
        "df -Pk {} 2>/dev/null | tail -1 | awk '{{print $4}}'",
        shell_words::quote(path)
    )
}

async fn check_nix_daemon(session: &dyn RemoteSession) -> FleetResult<CheckResult> {
    const NAME: &str = "nix_daemon";
    let command = "systemctl is-active nix-daemon";
    let out = session.exec(command).await?;

    let status = out.stdout.trim();
    if status != "active" {
        return Ok(CheckResult::fail(NAME, command, out.exit_code, "nix daemon is not running")
            .with_details(format!("status {status:?}; start it with `systemctl start nix-daemon`")));
    }
    nix_version(session, NAME, "nix daemon is active").await
}

async fn check_nix_store(session: &dyn RemoteSession) -> FleetResult<CheckResult> {
    const NAME: &str = "nix_store";
    let command = "nix-store --verify 2>&1 | head -5";
    let out = session.exec_sudo(command).await?;

    // `nix-store --verify` exits 0 on some errors; its output tells.
    if out.stdout.contains("error:") {
        return Ok(CheckResult::fail(NAME, command, out.exit_code, "nix store has errors")
            .with_details(out.stdout.trim()));
    }
    nix_version(session, NAME, "nix store is healthy").await
}

async fn nix_version(
    session: &dyn RemoteSession,
    name: &'static str,
    message: &str,
) -> FleetResult<CheckResult> {
    let command = "nix --version";
    let out = session.exec(command).await?;
    if !out.success() {
        return Ok(CheckResult::fail(name, command, out.exit_code, "nix command not available")
            .with_details(out.stderr.trim()));
    }
    Ok(CheckResult::pass(name, message).with_details(out.stdout.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::testing::FakeHost;

    #[tokio::test]
    async fn healthy_ubuntu_host_passes_every_check() {
        let fake = FakeHost::new("web-1");
        let report = run_preflight(&fake, BaseOs::Ubuntu, &PreflightConfig::default())
            .await
            .unwrap();

        let names: Vec<&str> = report.checks.iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            vec![
                "ssh_connectivity",
                "sudo_permissions",
                "disk_space_nix",
                "disk_space_var",
                "nix_daemon"
            ]
        );
        assert!(report.passed(), "{report:?}");
        assert_eq!(report.summary(), "5/5 checks passed");
    }

    #[tokio::test]
    async fn nixos_verifies_the_store() {
        let fake = FakeHost::new("nix-1");
        let report = run_preflight(&fake, BaseOs::Nixos, &PreflightConfig::default())
            .await
            .unwrap();
        assert!(report.passed());
        assert_eq!(report.checks.last().map(|c| c.name), Some("nix_store"));
        assert!(fake
            .executed()
            .iter()
            .any(|c| c.starts_with("sudo nix-store --verify")));

        fake.respond("nix-store --verify", 0, "error: path '/nix/store/abc' is corrupt\n");
        let report = run_preflight(&fake, BaseOs::Nixos, &PreflightConfig::default())
            .await
            .unwrap();
        assert!(!report.passed());
    }

    #[tokio::test]
    async fn low_disk_fails_with_the_df_command() {
        let fake = FakeHost::new("web-1");
        // 2 GiB free on /nix, 5 required.
        fake.respond("df -Pk /nix", 0, "2097152\n");

        let report = run_preflight(&fake, BaseOs::Ubuntu, &PreflightConfig::default())
            .await
            .unwrap();
        assert!(!report.passed());
        assert_eq!(report.summary(), "4/5 checks passed");

        let err = report.into_result("web-1").unwrap_err();
        assert_eq!(err.kind(), FailureKind::Command);
        match err {
            FleetError::Command { command, stderr, .. } => {
                assert!(command.starts_with("df -Pk /nix"));
                assert!(stderr.contains("available 2GB, required 5GB"), "{stderr}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_sudo_and_stopped_daemon_are_reported() {
        let fake = FakeHost::new("web-1");
        fake.respond("sudo -n true", 1, "");
        fake.respond("systemctl is-active nix-daemon", 3, "inactive\n");

        let report = run_preflight(&fake, BaseOs::Ubuntu, &PreflightConfig::default())
            .await
            .unwrap();
        let failed: Vec<&str> = report
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.name)
            .collect();
        assert_eq!(failed, vec!["sudo_permissions", "nix_daemon"]);
    }

    #[tokio::test]
    async fn unparsable_free_space_fails_the_check() {
        let fake = FakeHost::new("web-1");
        fake.respond("df -Pk /var", 0, "Avail\n");
        let report = run_preflight(&fake, BaseOs::Unknown, &PreflightConfig::default())
            .await
            .unwrap();
        assert_eq!(report.checks.len(), 4);
        assert!(!report.checks[3].passed);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_connection_error() {
        let fake = FakeHost::new("web-1");
        fake.set_unreachable(true);
        let err = run_preflight(&fake, BaseOs::Ubuntu, &PreflightConfig::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Connection);
    }
}
