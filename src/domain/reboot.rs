//! Reboot detection and the gated reboot sequence.
//!
//! A reboot walks `WindowGate → PreHook → Rebooting → AwaitingReturn →
//! PostHook → Done`. Any gated step can end in `Failed`; the report records
//! where. The orchestrator never bounds concurrency itself; callers hold a
//! [`ConcurrencyLimiter`](super::limiter::ConcurrencyLimiter) permit around
//! [`RebootOrchestrator::execute_reboot`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::host::{BaseOs, Host};
use super::state_store::StateStore;
use super::window::{is_in_window, next_window_start, RebootWindow};
use crate::error::{FailureKind, FleetError, FleetResult};
use crate::transport::{RemoteSession, SessionPool};

const LIVENESS_COMMAND: &str = "echo reboot-complete";
const LIVENESS_REPLY: &str = "reboot-complete";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebootStatus {
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trigger_packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebootConfig {
    pub allow: bool,
    pub window: Option<RebootWindow>,
    pub max_concurrent: usize,
    pub pre_hook: Option<String>,
    pub post_hook: Option<String>,
    pub wait_timeout: Duration,
    pub wait_interval: Duration,
    /// Fixed wait after issuing the reboot before probing for return.
    pub settle_delay: Duration,
    pub reboot_command: String,
    /// Poll until the host stops answering instead of sleeping `settle_delay`.
    pub await_shutdown: bool,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            allow: false,
            window: None,
            max_concurrent: 1,
            pre_hook: None,
            post_hook: None,
            wait_timeout: Duration::from_secs(600),
            wait_interval: Duration::from_secs(10),
            settle_delay: Duration::from_secs(70),
            reboot_command: "shutdown -r +1 'convoy scheduled reboot'".to_string(),
            await_shutdown: false,
        }
    }
}

impl RebootConfig {
    /// Fleet-wide settings with the host's own allow flag and window on top.
    pub fn for_host(&self, host: &Host) -> RebootConfig {
        RebootConfig {
            allow: self.allow || host.os_update.allow_reboot,
            window: host.os_update.reboot_window.or(self.window),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebootPhase {
    Idle,
    CheckRequired,
    WindowGate,
    PreHook,
    Rebooting,
    AwaitingReturn,
    PostHook,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebootReport {
    pub host: String,
    pub phase: RebootPhase,
    /// Last phase entered before failing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<RebootPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    pub elapsed: Duration,
}

impl RebootReport {
    pub fn succeeded(&self) -> bool {
        self.phase == RebootPhase::Done
    }

    pub fn refused(&self) -> bool {
        self.error_kind == Some(FailureKind::PolicyViolation)
    }
}

// ── Detection ────────────────────────────────────────────────

/// Ask the host whether it needs a reboot to run what is installed.
pub async fn check_reboot_required(
    session: &dyn RemoteSession,
    base: BaseOs,
) -> FleetResult<RebootStatus> {
    match base {
        BaseOs::Ubuntu => check_ubuntu(session).await,
        BaseOs::Nixos => check_nixos(session).await,
        BaseOs::Unknown => Ok(RebootStatus::default()),
    }
}

async fn check_ubuntu(session: &dyn RemoteSession) -> FleetResult<RebootStatus> {
    let sentinel = session
        .exec("test -f /var/run/reboot-required && echo yes || echo no")
        .await?;
    if sentinel.stdout.trim() != "yes" {
        return Ok(RebootStatus::default());
    }

    let pkgs = session
        .exec("cat /var/run/reboot-required.pkgs 2>/dev/null || true")
        .await?;
    let mut trigger_packages: Vec<String> = Vec::new();
    for line in pkgs.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !trigger_packages.iter().any(|p| p == line) {
            trigger_packages.push(line.to_string());
        }
    }

    Ok(RebootStatus {
        required: true,
        reason: "reboot-required file present".to_string(),
        trigger_packages,
    })
}

async fn check_nixos(session: &dyn RemoteSession) -> FleetResult<RebootStatus> {
    let current = first_line(session, "readlink -f /run/current-system 2>/dev/null").await?;
    let booted = first_line(session, "readlink -f /run/booted-system 2>/dev/null").await?;

    if !current.is_empty() && booted.is_empty() {
        return Ok(RebootStatus {
            required: true,
            reason: "booted-system unreadable".to_string(),
            trigger_packages: Vec::new(),
        });
    }
    if !current.is_empty() && current != booted {
        return Ok(RebootStatus {
            required: true,
            reason: "system configuration changed since boot".to_string(),
            trigger_packages: Vec::new(),
        });
    }

    let running = first_line(session, "uname -r").await?;
    let modules = session
        .exec("ls /run/current-system/kernel-modules/lib/modules 2>/dev/null")
        .await?;
    let available: Vec<&str> = modules.stdout.split_whitespace().collect();

    if !running.is_empty() && !available.is_empty() && !available.contains(&running.as_str()) {
        return Ok(RebootStatus {
            required: true,
            reason: format!("new kernel available: {}", available.join(", ")),
            trigger_packages: Vec::new(),
        });
    }

    Ok(RebootStatus::default())
}

async fn first_line(session: &dyn RemoteSession, command: &str) -> FleetResult<String> {
    let out = session.exec(command).await?;
    if !out.success() {
        return Ok(String::new());
    }
    Ok(out.stdout.lines().next().unwrap_or_default().trim().to_string())
}

// ── Orchestration ────────────────────────────────────────────

pub struct RebootOrchestrator {
    config: RebootConfig,
    pool: Arc<dyn SessionPool>,
    state: Option<StateStore>,
}

impl RebootOrchestrator {
    pub fn new(config: RebootConfig, pool: Arc<dyn SessionPool>) -> Self {
        Self {
            config,
            pool,
            state: None,
        }
    }

    /// Record completed reboots in the host state document.
    pub fn with_state_store(mut self, state: StateStore) -> Self {
        self.state = Some(state);
        self
    }

    pub fn config(&self) -> &RebootConfig {
        &self.config
    }

    /// Policy gate: allow flag, then window membership at `now`.
    pub fn gate(&self, host: &Host, now: NaiveDateTime) -> FleetResult<()> {
        let config = self.config.for_host(host);
        if !config.allow {
            return Err(FleetError::RebootDisallowed {
                host: host.name.clone(),
            });
        }

        if let Some(window) = config.window.as_ref() {
            if !is_in_window(Some(window), now) {
                return Err(FleetError::OutsideWindow {
                    host: host.name.clone(),
                    window: window.to_string(),
                    next: next_window_start(Some(window), now),
                });
            }
        }

        Ok(())
    }

    #[instrument(skip_all, fields(host = %host.name))]
    pub async fn execute_reboot(&self, host: &Host, cancel: &CancellationToken) -> RebootReport {
        let started = Instant::now();
        let mut phase = RebootPhase::Idle;

        let result = self.run_phases(host, cancel, &mut phase).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                info!(elapsed = ?elapsed, "reboot complete");
                RebootReport {
                    host: host.name.clone(),
                    phase: RebootPhase::Done,
                    failed_at: None,
                    error: None,
                    error_kind: None,
                    elapsed,
                }
            }
            Err(e) => {
                if e.is_policy_violation() {
                    info!(reason = %e, "reboot deferred");
                } else {
                    warn!(error = %e, phase = ?phase, "reboot failed");
                }
                RebootReport {
                    host: host.name.clone(),
                    phase: RebootPhase::Failed,
                    failed_at: Some(phase),
                    error_kind: Some(e.kind()),
                    error: Some(e.to_string()),
                    elapsed,
                }
            }
        }
    }

    async fn run_phases(
        &self,
        host: &Host,
        cancel: &CancellationToken,
        phase: &mut RebootPhase,
    ) -> FleetResult<()> {
        let config = self.config.for_host(host);
        let target = host.target();

        *phase = RebootPhase::WindowGate;
        self.gate(host, Local::now().naive_local())?;
        if cancel.is_cancelled() {
            return Err(FleetError::Cancelled);
        }

        let session = self.pool.session(&target).await?;

        *phase = RebootPhase::PreHook;
        if let Some(hook) = config.pre_hook.as_deref() {
            run_hook(session.as_ref(), &host.name, "pre-reboot", hook).await?;
        }

        *phase = RebootPhase::Rebooting;
        match session.exec_sudo(&config.reboot_command).await {
            Ok(out) => {
                out.check(&host.name, &config.reboot_command)?;
            }
            // An immediate reboot can drop the connection before it answers.
            Err(FleetError::Connection { reason, .. }) => {
                debug!(reason = %reason, "connection dropped while issuing reboot");
            }
            Err(e) => return Err(e),
        }
        info!(command = %config.reboot_command, "reboot issued");
        drop(session);
        self.pool.evict(&target).await;

        if config.await_shutdown {
            self.wait_until_down(host, &config, cancel).await?;
        } else {
            sleep_or_cancel(config.settle_delay, cancel).await?;
        }

        *phase = RebootPhase::AwaitingReturn;
        let session = self.wait_for_return(host, &config, cancel).await?;

        *phase = RebootPhase::PostHook;
        if let Some(hook) = config.post_hook.as_deref() {
            run_hook(session.as_ref(), &host.name, "post-reboot", hook).await?;
        }

        if let Some(state) = &self.state {
            if let Err(e) = state.record_reboot(session.as_ref()).await {
                warn!(error = %e, "failed to record reboot in state document");
            }
        }

        Ok(())
    }

    async fn wait_until_down(
        &self,
        host: &Host,
        config: &RebootConfig,
        cancel: &CancellationToken,
    ) -> FleetResult<()> {
        let target = host.target();
        let started = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(FleetError::Cancelled);
            }
            if !self.is_reachable(&target).await {
                debug!("host stopped answering");
                return Ok(());
            }
            self.pool.evict(&target).await;
            if started.elapsed() >= config.wait_timeout {
                return Err(FleetError::RebootTimeout {
                    host: host.name.clone(),
                    waited: started.elapsed(),
                });
            }
            sleep_or_cancel(config.wait_interval, cancel).await?;
        }
    }

    async fn wait_for_return(
        &self,
        host: &Host,
        config: &RebootConfig,
        cancel: &CancellationToken,
    ) -> FleetResult<Arc<dyn RemoteSession>> {
        let target = host.target();
        let started = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(FleetError::Cancelled);
            }
            if let Ok(session) = self.pool.session(&target).await {
                match session.exec(LIVENESS_COMMAND).await {
                    Ok(out) if out.stdout.trim() == LIVENESS_REPLY => return Ok(session),
                    Ok(_) | Err(_) => {
                        drop(session);
                        self.pool.evict(&target).await;
                    }
                }
            }

            let waited = started.elapsed();
            if waited >= config.wait_timeout {
                return Err(FleetError::RebootTimeout {
                    host: host.name.clone(),
                    waited,
                });
            }
            debug!(waited = ?waited, "host not back yet");
            sleep_or_cancel(config.wait_interval, cancel).await?;
        }
    }

    async fn is_reachable(&self, target: &crate::transport::SshTarget) -> bool {
        match self.pool.session(target).await {
            Ok(session) => matches!(
                session.exec(LIVENESS_COMMAND).await,
                Ok(out) if out.stdout.trim() == LIVENESS_REPLY
            ),
            Err(_) => false,
        }
    }
}

async fn run_hook(
    session: &dyn RemoteSession,
    host: &str,
    stage: &'static str,
    command: &str,
) -> FleetResult<()> {
    let out = session.exec_sudo(command).await.map_err(|e| FleetError::Hook {
        host: host.to_string(),
        stage,
        reason: e.to_string(),
    })?;
    if !out.success() {
        return Err(FleetError::Hook {
            host: host.to_string(),
            stage,
            reason: format!("exit {}: {}", out.exit_code, out.stderr.trim()),
        });
    }
    debug!(stage, "hook succeeded");
    Ok(())
}

pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> FleetResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(FleetError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{host, FakeHost, FakePool};
    use chrono::NaiveDate;

    fn allowed(name: &str) -> Host {
        let mut h = host(name, BaseOs::Ubuntu);
        h.os_update.allow_reboot = true;
        h
    }

    fn fast_config() -> RebootConfig {
        RebootConfig {
            wait_timeout: Duration::from_secs(60),
            wait_interval: Duration::from_secs(5),
            settle_delay: Duration::from_secs(10),
            ..RebootConfig::default()
        }
    }

    #[tokio::test]
    async fn ubuntu_sentinel_with_packages() {
        let fake = FakeHost::new("web-1");
        fake.respond("test -f /var/run/reboot-required", 0, "yes\n");
        fake.respond(
            "cat /var/run/reboot-required.pkgs",
            0,
            "linux-image-6.8.0-45-generic\nlibc6\nlibc6\n",
        );

        let status = check_reboot_required(&fake, BaseOs::Ubuntu).await.unwrap();
        assert!(status.required);
        assert_eq!(
            status.trigger_packages,
            vec!["linux-image-6.8.0-45-generic", "libc6"]
        );
    }

    #[tokio::test]
    async fn ubuntu_without_sentinel() {
        let fake = FakeHost::new("web-1");
        fake.respond("test -f /var/run/reboot-required", 0, "no\n");
        let status = check_reboot_required(&fake, BaseOs::Ubuntu).await.unwrap();
        assert!(!status.required);
    }

    #[tokio::test]
    async fn nixos_generation_mismatch() {
        let fake = FakeHost::new("nix-1");
        fake.respond("readlink -f /run/current-system", 0, "/nix/store/bbb-nixos-system\n");
        fake.respond("readlink -f /run/booted-system", 0, "/nix/store/aaa-nixos-system\n");
        let status = check_reboot_required(&fake, BaseOs::Nixos).await.unwrap();
        assert!(status.required);
        assert!(status.reason.contains("changed since boot"));
    }

    #[tokio::test]
    async fn nixos_unreadable_booted_system_requires_reboot() {
        let fake = FakeHost::new("nix-1");
        fake.respond("readlink -f /run/current-system", 0, "/nix/store/aaa-nixos-system\n");
        fake.respond("readlink -f /run/booted-system", 1, "");
        let status = check_reboot_required(&fake, BaseOs::Nixos).await.unwrap();
        assert!(status.required);
        assert_eq!(status.reason, "booted-system unreadable");

        fake.respond("readlink -f /run/booted-system", 0, "\n");
        let status = check_reboot_required(&fake, BaseOs::Nixos).await.unwrap();
        assert!(status.required);
    }

    #[tokio::test]
    async fn nixos_kernel_mismatch() {
        let fake = FakeHost::new("nix-1");
        fake.respond("readlink -f /run/current-system", 0, "/nix/store/aaa-nixos-system\n");
        fake.respond("readlink -f /run/booted-system", 0, "/nix/store/aaa-nixos-system\n");
        fake.respond("uname -r", 0, "6.6.30\n");
        fake.respond("ls /run/current-system/kernel-modules", 0, "6.6.52\n");

        let status = check_reboot_required(&fake, BaseOs::Nixos).await.unwrap();
        assert!(status.required);
        assert!(status.reason.contains("6.6.52"));

        fake.respond("ls /run/current-system/kernel-modules", 0, "6.6.30\n");
        let status = check_reboot_required(&fake, BaseOs::Nixos).await.unwrap();
        assert!(!status.required);
    }

    #[tokio::test]
    async fn unknown_base_never_requires_reboot() {
        let fake = FakeHost::new("odd-1");
        let status = check_reboot_required(&fake, BaseOs::Unknown).await.unwrap();
        assert!(!status.required);
        assert!(fake.executed().is_empty());
    }

    #[test]
    fn host_policy_overlays_fleet_config() {
        let mut h = allowed("web-1");
        h.os_update.reboot_window = Some("Sat 01:00-03:00".parse().unwrap());
        let fleet = RebootConfig {
            window: Some("Sun 02:00-04:00".parse().unwrap()),
            ..RebootConfig::default()
        };
        let merged = fleet.for_host(&h);
        assert!(merged.allow);
        assert_eq!(merged.window.unwrap().to_string(), "Sat 01:00-03:00");
    }

    #[test]
    fn gate_reports_next_window() {
        let pool = Arc::new(FakePool::new());
        let orchestrator = RebootOrchestrator::new(
            RebootConfig {
                window: Some("Sun 02:00-04:00".parse().unwrap()),
                ..RebootConfig::default()
            },
            pool,
        );
        // Monday 2026-10-19 noon.
        let now = NaiveDate::from_ymd_opt(2026, 10, 19)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap();

        match orchestrator.gate(&allowed("web-1"), now) {
            Err(FleetError::OutsideWindow { next, .. }) => {
                assert_eq!(next.to_string(), "2026-10-25 02:00:00");
            }
            other => panic!("unexpected {other:?}"),
        }

        let sunday = NaiveDate::from_ymd_opt(2026, 10, 25)
            .and_then(|d| d.and_hms_opt(3, 0, 0))
            .unwrap();
        assert!(orchestrator.gate(&allowed("web-1"), sunday).is_ok());
    }

    #[tokio::test]
    async fn refuses_when_not_allowed() {
        let pool = Arc::new(FakePool::new());
        let fake = pool.add(&host("web-1", BaseOs::Ubuntu));
        let orchestrator = RebootOrchestrator::new(RebootConfig::default(), pool.clone());

        let report = orchestrator
            .execute_reboot(&host("web-1", BaseOs::Ubuntu), &CancellationToken::new())
            .await;

        assert!(report.refused());
        assert_eq!(report.failed_at, Some(RebootPhase::WindowGate));
        assert!(fake.executed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reboots_and_waits_for_return() {
        let pool = Arc::new(FakePool::new());
        let h = allowed("web-1");
        let fake = pool.add(&h);
        fake.set_reboot_downtime(3);

        let orchestrator = RebootOrchestrator::new(
            RebootConfig {
                pre_hook: Some("systemctl stop app".into()),
                post_hook: Some("systemctl start app".into()),
                ..fast_config()
            },
            pool.clone(),
        )
        .with_state_store(StateStore::default());

        let report = orchestrator.execute_reboot(&h, &CancellationToken::new()).await;
        assert!(report.succeeded(), "{report:?}");

        let log = fake.executed();
        let pos = |needle: &str| log.iter().position(|c| c.contains(needle)).unwrap();
        assert!(pos("systemctl stop app") < pos("shutdown -r"));
        assert!(pos("shutdown -r") < pos("systemctl start app"));
        assert!(pool.evictions().contains(&h.target()));
        assert!(fake.file(crate::domain::state_store::DEFAULT_STATE_PATH)
            .unwrap()
            .contains("last_reboot"));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_host_stays_down() {
        let pool = Arc::new(FakePool::new());
        let h = allowed("web-1");
        let fake = pool.add(&h);
        fake.set_reboot_downtime(usize::MAX);

        let orchestrator = RebootOrchestrator::new(
            RebootConfig {
                post_hook: Some("systemctl start app".into()),
                ..fast_config()
            },
            pool.clone(),
        );

        let report = orchestrator.execute_reboot(&h, &CancellationToken::new()).await;
        assert_eq!(report.error_kind, Some(FailureKind::Timeout));
        assert_eq!(report.failed_at, Some(RebootPhase::AwaitingReturn));
        assert!(!fake.executed().iter().any(|c| c.contains("systemctl start app")));
    }

    #[tokio::test]
    async fn failing_pre_hook_aborts_before_reboot() {
        let pool = Arc::new(FakePool::new());
        let h = allowed("web-1");
        let fake = pool.add(&h);
        fake.respond("drain-node", 2, "");

        let orchestrator = RebootOrchestrator::new(
            RebootConfig {
                pre_hook: Some("drain-node".into()),
                ..fast_config()
            },
            pool.clone(),
        );

        let report = orchestrator.execute_reboot(&h, &CancellationToken::new()).await;
        assert_eq!(report.error_kind, Some(FailureKind::Hook));
        assert!(!fake.executed().iter().any(|c| c.contains("shutdown")));
    }

    #[tokio::test(start_paused = true)]
    async fn strict_mode_waits_for_shutdown() {
        let pool = Arc::new(FakePool::new());
        let h = allowed("web-1");
        let fake = pool.add(&h);
        fake.set_reboot_downtime(2);

        let orchestrator = RebootOrchestrator::new(
            RebootConfig {
                await_shutdown: true,
                ..fast_config()
            },
            pool.clone(),
        );

        let report = orchestrator.execute_reboot(&h, &CancellationToken::new()).await;
        assert!(report.succeeded(), "{report:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_settle() {
        let pool = Arc::new(FakePool::new());
        let h = allowed("web-1");
        pool.add(&h);

        let orchestrator = RebootOrchestrator::new(fast_config(), pool.clone());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let report = orchestrator.execute_reboot(&h, &cancel).await;
        assert_eq!(report.error_kind, Some(FailureKind::Cancelled));
    }
}
