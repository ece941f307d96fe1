//! Job tracking for long-running fleet operations.
//!
//! Jobs are owned by the caller; nothing in the engine depends on them. The
//! CLI uses a tracker to write a machine-readable record of a rollout.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Apply,
    Rollout,
    DriftCheck,
    Reboot,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Apply => write!(f, "apply"),
            JobKind::Rollout => write!(f, "rollout"),
            JobKind::DriftCheck => write!(f, "drift-check"),
            JobKind::Reboot => write!(f, "reboot"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
pub struct JobTracker {
    jobs: RwLock<HashMap<String, Job>>,
    seq: AtomicU64,
    write_lock: Mutex<()>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, kind: JobKind, host: Option<&str>) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{kind}-{seq:06}");
        let job = Job {
            id: id.clone(),
            kind,
            status: JobStatus::Pending,
            host: host.map(str::to_string),
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            result: None,
            error: None,
        };
        self.jobs.write().await.insert(id.clone(), job);
        id
    }

    pub async fn start(&self, id: &str) -> bool {
        self.update(id, |job| {
            job.status = JobStatus::Running;
            job.start_time = Some(Utc::now());
        })
        .await
    }

    pub async fn complete(&self, id: &str, result: serde_json::Value) -> bool {
        self.update(id, |job| {
            job.status = JobStatus::Completed;
            job.end_time = Some(Utc::now());
            job.result = Some(result);
        })
        .await
    }

    pub async fn fail(&self, id: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        self.update(id, |job| {
            job.status = JobStatus::Failed;
            job.end_time = Some(Utc::now());
            job.error = Some(error);
        })
        .await
    }

    pub async fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().await.get(id).cloned()
    }

    /// All jobs, newest first.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.id_seq().cmp(&a.id_seq()));
        jobs
    }

    async fn update(&self, id: &str, apply: impl FnOnce(&mut Job)) -> bool {
        match self.jobs.write().await.get_mut(id) {
            Some(job) => {
                apply(job);
                true
            }
            None => {
                warn!(job = id, "update for unknown job");
                false
            }
        }
    }

    /// Atomically write every job, with a checksum, to `path`.
    pub async fn persist(&self, path: &Path) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let stored = StoredJobs::new(self.list().await)?;
        let content =
            serde_json::to_string_pretty(&stored).context("failed to serialize job record")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &content)
            .await
            .with_context(|| format!("writing temp file {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()))?;

        Ok(())
    }
}

impl Job {
    fn id_seq(&self) -> u64 {
        self.id
            .rsplit('-')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

/// On-disk job record; the checksum covers the serialized job list.
#[derive(Debug, Serialize, Deserialize)]
pub struct StoredJobs {
    pub checksum: String,
    pub written_at: DateTime<Utc>,
    pub jobs: Vec<Job>,
}

impl StoredJobs {
    fn new(jobs: Vec<Job>) -> Result<Self> {
        let checksum = checksum_of(&jobs)?;
        Ok(Self {
            checksum,
            written_at: Utc::now(),
            jobs,
        })
    }

    pub fn verify(&self) -> bool {
        checksum_of(&self.jobs).is_ok_and(|c| c == self.checksum)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let stored: StoredJobs = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        if !stored.verify() {
            bail!("checksum verification failed for {}", path.display());
        }
        Ok(stored)
    }
}

fn checksum_of(jobs: &[Job]) -> Result<String> {
    let body = serde_json::to_vec(jobs).context("failed to serialize jobs for checksum")?;
    Ok(format!("sha256:{:x}", Sha256::digest(&body)))
}
