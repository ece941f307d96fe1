//! Rollout planning and execution.
//!
//! Batches run strictly one after another. Inside a batch, hosts run on a
//! [`JoinSet`] holding at most `max_parallel` tasks. The canary batch gates
//! everything after it and runs one host at a time: the first canary failure
//! leaves the rest of the canary batch and every later batch untouched.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::host::Host;
use super::limiter::ConcurrencyLimiter;
use super::pipeline::{ApplyPipeline, HostOutcome};
use super::reboot::{sleep_or_cancel, RebootOrchestrator};
use crate::error::FailureKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Serial,
    Parallel,
    #[default]
    Canary,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "serial" => Ok(Strategy::Serial),
            "parallel" => Ok(Strategy::Parallel),
            "canary" => Ok(Strategy::Canary),
            _ => Err(format!(
                "unknown strategy: {s} (expected serial, parallel or canary)"
            )),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Serial => write!(f, "serial"),
            Strategy::Parallel => write!(f, "parallel"),
            Strategy::Canary => write!(f, "canary"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RolloutBatch {
    pub index: usize,
    pub canary: bool,
    pub hosts: Vec<Host>,
}

impl RolloutBatch {
    pub fn host_names(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.name.clone()).collect()
    }
}

/// Number of hosts in the canary batch for `n` hosts at `percent`.
pub fn canary_size(n: usize, percent: u32) -> usize {
    (n * percent as usize / 100).max(1)
}

/// Split `hosts` into ordered batches. Host order is preserved.
pub fn plan(hosts: &[Host], strategy: Strategy, canary_percent: u32) -> Vec<RolloutBatch> {
    if hosts.is_empty() {
        return Vec::new();
    }

    let batch = |index: usize, canary: bool, hosts: &[Host]| RolloutBatch {
        index,
        canary,
        hosts: hosts.to_vec(),
    };

    match strategy {
        Strategy::Serial => hosts
            .iter()
            .enumerate()
            .map(|(i, h)| batch(i, false, std::slice::from_ref(h)))
            .collect(),
        Strategy::Parallel => vec![batch(0, false, hosts)],
        Strategy::Canary => {
            let count = canary_size(hosts.len(), canary_percent);
            if count >= hosts.len() {
                vec![batch(0, false, hosts)]
            } else {
                vec![
                    batch(0, true, &hosts[..count]),
                    batch(1, false, &hosts[count..]),
                ]
            }
        }
    }
}

/// Rollout knobs for one run: the fleet configuration, tightened by any
/// selected host whose own policy asks for more caution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutSettings {
    pub canary_percent: u32,
    pub max_parallel: usize,
    pub pause_between_batches: Duration,
    pub max_concurrent_reboots: usize,
}

impl RolloutSettings {
    /// Smallest canary, parallelism and reboot budget, longest pause.
    pub fn tightened_by(self, hosts: &[Host]) -> Self {
        hosts.iter().fold(self, |acc, host| RolloutSettings {
            canary_percent: host
                .rollout
                .canary_percent
                .map_or(acc.canary_percent, |p| p.min(acc.canary_percent)),
            max_parallel: host
                .rollout
                .max_parallel
                .map_or(acc.max_parallel, |m| m.max(1).min(acc.max_parallel)),
            pause_between_batches: host
                .rollout
                .pause_between_batches_secs
                .map_or(acc.pause_between_batches, |secs| {
                    Duration::from_secs(secs).max(acc.pause_between_batches)
                }),
            max_concurrent_reboots: host
                .os_update
                .max_concurrent_reboots
                .map_or(acc.max_concurrent_reboots, |m| {
                    m.max(1).min(acc.max_concurrent_reboots)
                }),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RolloutOptions {
    pub max_parallel: usize,
    pub pause_between_batches: Duration,
    /// Reboot hosts that report a required reboot and allow it.
    pub reboot: bool,
}

impl Default for RolloutOptions {
    fn default() -> Self {
        Self {
            max_parallel: 5,
            pause_between_batches: Duration::ZERO,
            reboot: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub index: usize,
    pub canary: bool,
    pub succeeded: usize,
    pub failed: usize,
    /// Hosts in this batch that were never dispatched.
    pub skipped: Vec<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct RolloutReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub batches: Vec<BatchReport>,
    pub succeeded: usize,
    pub failed: usize,
    pub hosts: Vec<HostOutcome>,
    /// Hosts never attempted, in plan order.
    pub skipped: Vec<String>,
}

impl RolloutReport {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            batches: Vec::new(),
            succeeded: 0,
            failed: 0,
            hosts: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn outcome(&self, host: &str) -> Option<&HostOutcome> {
        self.hosts.iter().find(|o| o.host == host)
    }

    fn absorb(&mut self, batch: BatchRun) {
        self.succeeded += batch.report.succeeded;
        self.failed += batch.report.failed;
        self.skipped.extend(batch.report.skipped.iter().cloned());
        self.hosts.extend(batch.outcomes);
        self.batches.push(batch.report);
    }

    fn skip_batches(&mut self, batches: &[RolloutBatch]) {
        for batch in batches {
            self.skipped.extend(batch.host_names());
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RolloutOutcome {
    Completed(RolloutReport),
    CanaryBatchFailed {
        report: RolloutReport,
        failed: Vec<String>,
    },
    Cancelled(RolloutReport),
}

impl RolloutOutcome {
    pub fn report(&self) -> &RolloutReport {
        match self {
            RolloutOutcome::Completed(report)
            | RolloutOutcome::Cancelled(report)
            | RolloutOutcome::CanaryBatchFailed { report, .. } => report,
        }
    }

    /// Completed with no failed hosts.
    pub fn is_clean(&self) -> bool {
        matches!(self, RolloutOutcome::Completed(report) if report.failed == 0)
    }
}

struct BatchRun {
    report: BatchReport,
    outcomes: Vec<HostOutcome>,
}

pub struct RolloutExecutor {
    pipeline: Arc<ApplyPipeline>,
    reboots: Option<Arc<RebootOrchestrator>>,
    limiter: ConcurrencyLimiter,
    options: RolloutOptions,
}

impl RolloutExecutor {
    pub fn new(
        pipeline: Arc<ApplyPipeline>,
        limiter: ConcurrencyLimiter,
        options: RolloutOptions,
    ) -> Self {
        Self {
            pipeline,
            reboots: None,
            limiter,
            options,
        }
    }

    pub fn with_reboots(mut self, orchestrator: Arc<RebootOrchestrator>) -> Self {
        self.reboots = Some(orchestrator);
        self
    }

    pub async fn run(&self, batches: Vec<RolloutBatch>, cancel: &CancellationToken) -> RolloutOutcome {
        let mut report = RolloutReport::new();
        let total = batches.len();

        for (position, batch) in batches.iter().enumerate() {
            let remaining = &batches[position..];

            if position > 0 && !self.options.pause_between_batches.is_zero() {
                info!(pause = ?self.options.pause_between_batches, "pausing between batches");
                if sleep_or_cancel(self.options.pause_between_batches, cancel)
                    .await
                    .is_err()
                {
                    report.skip_batches(remaining);
                    return finish(RolloutOutcome::Cancelled(report));
                }
            }

            if cancel.is_cancelled() {
                report.skip_batches(remaining);
                return finish(RolloutOutcome::Cancelled(report));
            }

            info!(
                batch = batch.index,
                of = total,
                canary = batch.canary,
                hosts = batch.hosts.len(),
                "starting batch"
            );
            let run = self.run_batch(batch, cancel).await;
            let failed: Vec<String> = run
                .outcomes
                .iter()
                .filter(|o| !o.succeeded())
                .map(|o| o.host.clone())
                .collect();
            info!(
                batch = batch.index,
                succeeded = run.report.succeeded,
                failed = run.report.failed,
                "batch finished"
            );
            report.absorb(run);

            if batch.canary && !failed.is_empty() {
                error!(failed = ?failed, "canary batch failed, aborting rollout");
                report.skip_batches(&batches[position + 1..]);
                return finish(RolloutOutcome::CanaryBatchFailed { report, failed });
            }

            if cancel.is_cancelled() {
                report.skip_batches(&batches[position + 1..]);
                return finish(RolloutOutcome::Cancelled(report));
            }
        }

        finish(RolloutOutcome::Completed(report))
    }

    async fn run_batch(&self, batch: &RolloutBatch, cancel: &CancellationToken) -> BatchRun {
        let started = Instant::now();
        // Each canary result must be known before the next canary host starts.
        let max_parallel = if batch.canary {
            1
        } else {
            self.options.max_parallel.max(1)
        };

        let mut tasks = JoinSet::new();
        let mut pending = batch.hosts.iter();
        let mut dispatched: Vec<String> = Vec::new();
        let mut outcomes: Vec<HostOutcome> = Vec::new();
        let mut halted = false;

        loop {
            while !halted && !cancel.is_cancelled() && tasks.len() < max_parallel {
                let Some(host) = pending.next() else { break };
                dispatched.push(host.name.clone());
                tasks.spawn(run_host(
                    Arc::clone(&self.pipeline),
                    self.reboots.clone(),
                    self.limiter.clone(),
                    self.options.reboot,
                    host.clone(),
                    cancel.clone(),
                ));
            }

            match tasks.join_next().await {
                None => break,
                Some(Ok(outcome)) => {
                    if batch.canary && !outcome.succeeded() && !halted {
                        warn!(host = %outcome.host, "canary host failed, halting dispatch");
                        halted = true;
                    }
                    outcomes.push(outcome);
                }
                Some(Err(e)) => {
                    error!(error = %e, "host task did not complete");
                    if batch.canary {
                        halted = true;
                    }
                }
            }
        }

        // A task that panicked leaves a dispatched host without an outcome.
        let reported: HashSet<String> = outcomes.iter().map(|o| o.host.clone()).collect();
        for name in dispatched.iter().filter(|n| !reported.contains(*n)) {
            outcomes.push(HostOutcome::failed(
                name,
                FailureKind::Internal,
                "host task panicked",
            ));
        }

        let skipped: Vec<String> = pending.map(|h| h.name.clone()).collect();
        let failed = outcomes.iter().filter(|o| !o.succeeded()).count();

        BatchRun {
            report: BatchReport {
                index: batch.index,
                canary: batch.canary,
                succeeded: outcomes.len() - failed,
                failed,
                skipped,
                elapsed: started.elapsed(),
            },
            outcomes,
        }
    }
}

fn finish(mut outcome: RolloutOutcome) -> RolloutOutcome {
    let report = match &mut outcome {
        RolloutOutcome::Completed(report)
        | RolloutOutcome::Cancelled(report)
        | RolloutOutcome::CanaryBatchFailed { report, .. } => report,
    };
    report.finished_at = Utc::now();
    outcome
}

async fn run_host(
    pipeline: Arc<ApplyPipeline>,
    reboots: Option<Arc<RebootOrchestrator>>,
    limiter: ConcurrencyLimiter,
    reboot_enabled: bool,
    host: Host,
    cancel: CancellationToken,
) -> HostOutcome {
    let mut outcome = pipeline.apply_host(&host, &cancel).await;

    if !reboot_enabled || !outcome.succeeded() || !outcome.needs_reboot() {
        return outcome;
    }
    let Some(orchestrator) = reboots else {
        return outcome;
    };

    if !orchestrator.config().for_host(&host).allow {
        outcome.warn("reboot required but not allowed by policy");
        return outcome;
    }

    let permit = match limiter.acquire(&cancel).await {
        Ok(permit) => permit,
        Err(e) => {
            outcome.fail(&e);
            return outcome;
        }
    };
    let report = orchestrator.execute_reboot(&host, &cancel).await;
    permit.release();

    if report.refused() {
        outcome.warn(format!(
            "reboot deferred: {}",
            report.error.as_deref().unwrap_or("policy")
        ));
    } else if !report.succeeded() {
        outcome.mark_failed(
            report.error_kind.unwrap_or(FailureKind::Internal),
            report.error.clone().unwrap_or_else(|| "reboot failed".to_string()),
        );
    }
    outcome.reboot = Some(report);
    outcome
}
