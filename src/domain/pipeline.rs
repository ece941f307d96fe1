//! Per-host apply pipeline.
//!
//! Stages run strictly in order for one host: preflight, build, idempotence
//! check, copy, activate, state update, reboot check, health check. Anything
//! that fails before activation completes fails the host. Once the host is
//! running the new configuration, later failures only add warnings, unless
//! the health failure policy says otherwise.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::health::{self, FailurePolicy, HealthCheck, HealthReport};
use super::host::{BaseOs, DesiredState, Host};
use super::host_state::HostState;
use super::preflight::{run_preflight, PreflightConfig, PreflightReport};
use super::reboot::{check_reboot_required, sleep_or_cancel, RebootReport, RebootStatus};
use super::state_store::{ApplyRecord, StateStore};
use crate::error::{FailureKind, FleetError, FleetResult};
use crate::nix::{Builder, Transfer};
use crate::transport::{RemoteSession, SessionPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Preflight,
    Build,
    IdempotenceCheck,
    Copy,
    Activate,
    StateUpdate,
    RebootCheck,
    HealthCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Skipped,
    Warning,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostDisposition {
    Applied,
    UpToDate,
    DryRun,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostOutcome {
    pub host: String,
    pub disposition: HostDisposition,
    pub stages: Vec<StageReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preflight: Option<PreflightReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub desired: Option<DesiredState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reboot_status: Option<RebootStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reboot: Option<RebootReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    pub elapsed: Duration,
}

impl HostOutcome {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            disposition: HostDisposition::Failed,
            stages: Vec::new(),
            preflight: None,
            desired: None,
            health: None,
            reboot_status: None,
            reboot: None,
            warnings: Vec::new(),
            error: None,
            error_kind: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Outcome for a host whose task never reported back.
    pub fn failed(host: &str, kind: FailureKind, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            error_kind: Some(kind),
            ..Self::new(host)
        }
    }

    pub fn succeeded(&self) -> bool {
        self.disposition != HostDisposition::Failed
    }

    pub fn needs_reboot(&self) -> bool {
        self.reboot_status.as_ref().is_some_and(|s| s.required)
    }

    pub fn fail(&mut self, error: &FleetError) {
        self.mark_failed(error.kind(), error.to_string());
    }

    /// Mark the host failed, for example after a reboot that never came back.
    pub fn mark_failed(&mut self, kind: FailureKind, error: impl Into<String>) {
        self.disposition = HostDisposition::Failed;
        self.error = Some(error.into());
        self.error_kind = Some(kind);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }

    fn record(&mut self, stage: Stage, status: StageStatus, detail: impl Into<String>, started: Instant) {
        self.stages.push(StageReport {
            stage,
            status,
            detail: detail.into(),
            elapsed: started.elapsed(),
        });
    }

    fn skip(&mut self, stages: &[Stage], detail: &str) {
        let now = Instant::now();
        for stage in stages {
            self.record(*stage, StageStatus::Skipped, detail, now);
        }
    }

    /// Record the stage as ok or failed and pass the result through.
    fn step<T>(&mut self, stage: Stage, started: Instant, result: FleetResult<T>) -> FleetResult<T> {
        match &result {
            Ok(_) => self.record(stage, StageStatus::Ok, "", started),
            Err(e) => self.record(stage, StageStatus::Failed, e.to_string(), started),
        }
        result
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub dry_run: bool,
    /// Apply even when the recorded manifest hash already matches, for
    /// example to repair content drift.
    pub force: bool,
    pub preflight: PreflightConfig,
    pub skip_health_checks: bool,
    pub health_check_delay: Duration,
    pub health_checks: Vec<HealthCheck>,
    pub health_policy: FailurePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            force: false,
            preflight: PreflightConfig::default(),
            skip_health_checks: false,
            health_check_delay: Duration::from_secs(5),
            health_checks: default_health_checks(),
            health_policy: FailurePolicy::default(),
        }
    }
}

pub fn default_health_checks() -> Vec<HealthCheck> {
    vec![HealthCheck::command("post_deploy", "echo post-deploy-ok")]
}

pub struct ApplyPipeline {
    config: PipelineConfig,
    pool: Arc<dyn SessionPool>,
    builder: Arc<dyn Builder>,
    transfer: Arc<dyn Transfer>,
    state: StateStore,
}

impl ApplyPipeline {
    pub fn new(
        config: PipelineConfig,
        pool: Arc<dyn SessionPool>,
        builder: Arc<dyn Builder>,
        transfer: Arc<dyn Transfer>,
        state: StateStore,
    ) -> Self {
        Self {
            config,
            pool,
            builder,
            transfer,
            state,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    #[instrument(skip_all, fields(host = %host.name))]
    pub async fn apply_host(&self, host: &Host, cancel: &CancellationToken) -> HostOutcome {
        let started = Instant::now();
        let mut outcome = HostOutcome::new(&host.name);

        match self.run_stages(host, &mut outcome, started, cancel).await {
            Ok(disposition) => {
                outcome.disposition = disposition;
                info!(disposition = ?disposition, warnings = outcome.warnings.len(), "host finished");
            }
            Err(e) => {
                warn!(error = %e, "host failed");
                outcome.fail(&e);
            }
        }

        outcome.elapsed = started.elapsed();
        outcome
    }

    async fn run_stages(
        &self,
        host: &Host,
        out: &mut HostOutcome,
        started: Instant,
        cancel: &CancellationToken,
    ) -> FleetResult<HostDisposition> {
        // Preflight
        let t = Instant::now();
        let preflight = self.preflight(host, out).await;
        let session = out.step(Stage::Preflight, t, preflight)?;

        // Build
        let t = Instant::now();
        let desired = out.step(
            Stage::Build,
            t,
            self.builder.build_host(&host.name, host.base).await,
        )?;
        match self.builder.closure_size(&desired.store_path).await {
            Ok(bytes) => debug!(store_path = %desired.store_path, bytes, "closure size"),
            Err(e) => debug!(error = %e, "closure size unavailable"),
        }
        out.desired = Some(desired.clone());

        // Idempotence
        let t = Instant::now();
        let recorded = out.step(
            Stage::IdempotenceCheck,
            t,
            self.state.read_state(session.as_ref()).await,
        )?;
        let converged = recorded.is_converged_to(&desired.manifest_hash);
        if converged && self.config.force {
            info!(manifest_hash = %desired.manifest_hash, "already converged, forcing apply");
        } else if converged {
            info!(manifest_hash = %desired.manifest_hash, "already converged");
            if recorded.drift_detected {
                out.warn(format!(
                    "drift recorded on {} file(s); apply with --force to restore them",
                    recorded.drift_files.len()
                ));
            }
            out.skip(
                &[Stage::Copy, Stage::Activate, Stage::StateUpdate],
                "manifest unchanged",
            );
            self.check_reboot(host, session.as_ref(), out).await;
            out.skip(&[Stage::HealthCheck], "manifest unchanged");
            return Ok(HostDisposition::UpToDate);
        }

        if self.config.dry_run {
            info!(
                from = %recorded.manifest_hash,
                to = %desired.manifest_hash,
                "dry run, would apply"
            );
            out.skip(
                &[
                    Stage::Copy,
                    Stage::Activate,
                    Stage::StateUpdate,
                    Stage::RebootCheck,
                    Stage::HealthCheck,
                ],
                "dry run",
            );
            return Ok(HostDisposition::DryRun);
        }

        // Copy
        let t = Instant::now();
        out.step(
            Stage::Copy,
            t,
            self.transfer.copy_to_host(&desired, host).await,
        )?;

        // Activate
        let t = Instant::now();
        out.step(
            Stage::Activate,
            t,
            activate(session.as_ref(), host, &desired.store_path).await,
        )?;
        info!(store_path = %desired.store_path, "activated");

        // Past this point the host runs the new configuration.
        self.update_state(host, session.as_ref(), &desired, &recorded, started, out)
            .await;
        self.check_reboot(host, session.as_ref(), out).await;
        self.health_check(host, &recorded, out, cancel).await?;

        Ok(HostDisposition::Applied)
    }

    async fn preflight(&self, host: &Host, out: &mut HostOutcome) -> FleetResult<Arc<dyn RemoteSession>> {
        let session = self.pool.session(&host.target()).await?;
        if self.config.preflight.skip {
            return Ok(session);
        }

        let report = run_preflight(session.as_ref(), host.base, &self.config.preflight).await?;
        out.preflight = Some(report.clone());
        report.into_result(&host.name)?;
        Ok(session)
    }

    async fn update_state(
        &self,
        host: &Host,
        session: &dyn RemoteSession,
        desired: &DesiredState,
        recorded: &HostState,
        started: Instant,
        out: &mut HostOutcome,
    ) {
        let t = Instant::now();
        let generation = read_generation(session, host.base)
            .await
            .unwrap_or(recorded.current_generation + 1);

        let record = ApplyRecord {
            hostname: host.name.clone(),
            base: host.base,
            store_path: desired.store_path.clone(),
            manifest_hash: desired.manifest_hash.clone(),
            generation,
            duration: started.elapsed(),
        };

        if let Err(e) = self.state.update_after_apply(session, &record).await {
            warn!(error = %e, "state update failed after activation");
            out.warn(format!("state update: {e}"));
            out.record(Stage::StateUpdate, StageStatus::Warning, e.to_string(), t);
            return;
        }

        let baseline = match self.state.snapshot_files(session, &desired.managed_files).await {
            Ok(files) => self.state.record_baseline(session, files).await,
            Err(e) => Err(e),
        };
        match baseline {
            Ok(()) => out.record(
                Stage::StateUpdate,
                StageStatus::Ok,
                format!("generation {generation}"),
                t,
            ),
            Err(e) => {
                warn!(error = %e, "drift baseline not recorded");
                out.warn(format!("drift baseline: {e}"));
                out.record(Stage::StateUpdate, StageStatus::Warning, e.to_string(), t);
            }
        }
    }

    async fn check_reboot(&self, host: &Host, session: &dyn RemoteSession, out: &mut HostOutcome) {
        let t = Instant::now();
        let status = match check_reboot_required(session, host.base).await {
            Ok(status) => status,
            Err(e) => {
                out.warn(format!("reboot check: {e}"));
                out.record(Stage::RebootCheck, StageStatus::Warning, e.to_string(), t);
                return;
            }
        };

        if let Err(e) = self.state.update_reboot_status(session, &status).await {
            out.warn(format!("recording reboot status: {e}"));
        }

        let detail = if status.required {
            info!(reason = %status.reason, "reboot required");
            status.reason.clone()
        } else {
            String::new()
        };
        out.record(Stage::RebootCheck, StageStatus::Ok, detail, t);
        out.reboot_status = Some(status);
    }

    async fn health_check(
        &self,
        host: &Host,
        recorded: &HostState,
        out: &mut HostOutcome,
        cancel: &CancellationToken,
    ) -> FleetResult<()> {
        if self.config.skip_health_checks || self.config.health_checks.is_empty() {
            out.skip(&[Stage::HealthCheck], "disabled");
            return Ok(());
        }

        let t = Instant::now();
        if sleep_or_cancel(self.config.health_check_delay, cancel).await.is_err() {
            out.warn("health checks cancelled");
            out.skip(&[Stage::HealthCheck], "cancelled");
            return Ok(());
        }

        // A fresh session: activation may have restarted sshd.
        let session = match self.pool.session(&host.target()).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "health check failed");
                out.warn(format!("health check: {e}"));
                out.record(Stage::HealthCheck, StageStatus::Warning, e.to_string(), t);
                return Ok(());
            }
        };

        let report = match health::run_checks(session.as_ref(), &self.config.health_checks, cancel).await {
            Ok(report) => report,
            Err(_) => {
                out.warn("health checks cancelled");
                out.skip(&[Stage::HealthCheck], "cancelled");
                return Ok(());
            }
        };
        let summary = report.summary();
        let passed = report.passed();
        out.health = Some(report);

        if passed {
            out.record(Stage::HealthCheck, StageStatus::Ok, summary, t);
            return Ok(());
        }

        warn!(summary = %summary, policy = %self.config.health_policy, "health checks failed");
        match self.config.health_policy {
            FailurePolicy::Continue => {
                out.warn(format!("health check: {summary}"));
                out.record(Stage::HealthCheck, StageStatus::Warning, summary, t);
                Ok(())
            }
            FailurePolicy::Halt => {
                out.record(Stage::HealthCheck, StageStatus::Failed, summary.clone(), t);
                Err(FleetError::HealthCheck {
                    host: host.name.clone(),
                    reason: summary,
                })
            }
            FailurePolicy::Rollback => {
                let reason = match health::roll_back(session.as_ref(), &host.name, host.base).await {
                    Ok(()) => {
                        info!("rolled back to the previous generation");
                        if let Err(e) = self.state.record_rollback(session.as_ref(), recorded).await {
                            out.warn(format!("recording rollback: {e}"));
                        }
                        format!("{summary}; rolled back to the previous generation")
                    }
                    Err(e) => format!("{summary}; rollback failed: {e}"),
                };
                out.record(Stage::HealthCheck, StageStatus::Failed, reason.clone(), t);
                Err(FleetError::HealthCheck {
                    host: host.name.clone(),
                    reason,
                })
            }
        }
    }
}

fn profile_for(base: BaseOs) -> Option<&'static str> {
    match base {
        BaseOs::Nixos => Some("/nix/var/nix/profiles/system"),
        BaseOs::Ubuntu => Some("/nix/var/nix/profiles/convoy/system"),
        BaseOs::Unknown => None,
    }
}

pub fn activation_command(base: BaseOs, store_path: &str) -> Option<String> {
    let profile = profile_for(base)?;
    let store = shell_words::quote(store_path);
    let switch = match base {
        BaseOs::Nixos => format!("{store}/bin/switch-to-configuration switch"),
        BaseOs::Ubuntu => format!("{store}/activate"),
        BaseOs::Unknown => return None,
    };
    Some(format!("nix-env -p {profile} --set {store} && {switch}"))
}

async fn activate(session: &dyn RemoteSession, host: &Host, store_path: &str) -> FleetResult<()> {
    let command = activation_command(host.base, store_path).ok_or_else(|| FleetError::Activation {
        host: host.name.clone(),
        reason: format!("unsupported base '{}'", host.base),
    })?;

    let out = session.exec_sudo(&command).await?;
    if !out.success() {
        return Err(FleetError::Activation {
            host: host.name.clone(),
            reason: format!("exit {}: {}", out.exit_code, out.stderr.trim()),
        });
    }
    Ok(())
}

/// Profile generation from the `system-<n>-link` the profile points at.
async fn read_generation(session: &dyn RemoteSession, base: BaseOs) -> Option<u64> {
    let profile = profile_for(base)?;
    let out = session.exec(&format!("readlink {profile}")).await.ok()?;
    if !out.success() {
        return None;
    }
    parse_generation(out.stdout.trim())
}

fn parse_generation(link: &str) -> Option<u64> {
    let name = link.rsplit('/').next()?;
    name.strip_suffix("-link")?.rsplit('-').next()?.parse().ok()
}
