//! Reads, writes and checks the state document on a remote host.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::host::{BaseOs, ManagedFile};
use super::host_state::{DriftResult, DriftStatus, FileState, HostState};
use super::reboot::RebootStatus;
use crate::error::{FleetError, FleetResult};
use crate::transport::RemoteSession;

pub const DEFAULT_STATE_PATH: &str = "/var/lib/convoy/state.json";

/// Outcome of a single drift remediation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftFix {
    Unchanged,
    Restored,
    /// Content is gone or different; only a fresh apply can restore it.
    RequiresReapply,
}

/// What a successful activation hands to [`StateStore::update_after_apply`].
#[derive(Debug, Clone)]
pub struct ApplyRecord {
    pub hostname: String,
    pub base: BaseOs,
    pub store_path: String,
    pub manifest_hash: String,
    pub generation: u64,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    path: String,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(DEFAULT_STATE_PATH)
    }
}

impl StateStore {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Missing or unparsable documents read as an empty state. Only transport
    /// failures are errors.
    pub async fn read_state(&self, session: &dyn RemoteSession) -> FleetResult<HostState> {
        let command = format!(
            "cat {} 2>/dev/null || echo '{{}}'",
            shell_words::quote(&self.path)
        );
        let output = session.exec_sudo(&command).await?;

        match serde_json::from_str::<HostState>(output.stdout.trim()) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(
                    host = %session.target().addr,
                    error = %e,
                    "unreadable state document, starting from empty state"
                );
                Ok(HostState::default())
            }
        }
    }

    /// Stamp and atomically replace the whole document.
    pub async fn write_state(
        &self,
        session: &dyn RemoteSession,
        state: &mut HostState,
    ) -> FleetResult<()> {
        let host = session.target().addr.clone();
        state.updated_at = Some(Utc::now());
        state.tool_version = env!("CARGO_PKG_VERSION").to_string();

        let body = serde_json::to_string_pretty(state).map_err(|e| FleetError::State {
            host: host.clone(),
            reason: format!("serializing state: {e}"),
        })?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(body.as_bytes());

        let dir = Path::new(&self.path)
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".to_string());
        let tmp = format!("{}.tmp", self.path);

        let command = format!(
            "mkdir -p {dir} && printf '%s' '{encoded}' | base64 -d > {tmp} && mv {tmp} {path}",
            dir = shell_words::quote(&dir),
            tmp = shell_words::quote(&tmp),
            path = shell_words::quote(&self.path),
        );

        let output = session.exec_sudo(&command).await?;
        if !output.success() {
            return Err(FleetError::State {
                host,
                reason: format!("writing {}: {}", self.path, output.stderr.trim()),
            });
        }

        debug!(host = %host, path = %self.path, "state document written");
        Ok(())
    }

    /// Compare each expected file with what is on disk. Results are ordered
    /// by path.
    pub async fn check_drift(
        &self,
        session: &dyn RemoteSession,
        expected: &BTreeMap<String, FileState>,
    ) -> FleetResult<Vec<DriftResult>> {
        let mut results = Vec::with_capacity(expected.len());

        for (path, want) in expected {
            let actual = inspect_file(session, path).await?;

            let status = match &actual {
                None => DriftStatus::Missing,
                Some(found) if found.hash != want.hash => DriftStatus::ContentChanged,
                Some(found) if !found.same_metadata(want) => DriftStatus::PermissionsChanged,
                Some(_) => DriftStatus::Ok,
            };

            results.push(DriftResult {
                path: path.clone(),
                status,
                expected: want.clone(),
                actual,
            });
        }

        Ok(results)
    }

    pub async fn fix_drift(
        &self,
        session: &dyn RemoteSession,
        result: &DriftResult,
    ) -> FleetResult<DriftFix> {
        match result.status {
            DriftStatus::Ok => Ok(DriftFix::Unchanged),
            DriftStatus::Missing | DriftStatus::ContentChanged => Ok(DriftFix::RequiresReapply),
            DriftStatus::PermissionsChanged => {
                let want = &result.expected;
                let path = shell_words::quote(&result.path);
                let command = format!(
                    "chmod {mode} {path} && chown {owner}:{group} {path}",
                    mode = shell_words::quote(&want.mode),
                    owner = shell_words::quote(&want.owner),
                    group = shell_words::quote(&want.group),
                );
                session
                    .exec_sudo(&command)
                    .await?
                    .check(&session.target().addr, &command)?;
                info!(host = %session.target().addr, path = %result.path, "restored file permissions");
                Ok(DriftFix::Restored)
            }
        }
    }

    /// The single point where a successful apply is recorded.
    pub async fn update_after_apply(
        &self,
        session: &dyn RemoteSession,
        record: &ApplyRecord,
    ) -> FleetResult<HostState> {
        let mut state = self.read_state(session).await?;

        state.hostname = record.hostname.clone();
        state.base = record.base;
        state.store_path = record.store_path.clone();
        state.manifest_hash = record.manifest_hash.clone();
        state.current_generation = record.generation;
        state.last_apply = Some(Utc::now());
        state.apply_duration = format!("{:.3?}", record.duration);

        self.write_state(session, &mut state).await?;
        Ok(state)
    }

    /// Point the document back at what a rollback returned the host to.
    pub async fn record_rollback(
        &self,
        session: &dyn RemoteSession,
        previous: &HostState,
    ) -> FleetResult<()> {
        let mut state = self.read_state(session).await?;
        state.store_path = previous.store_path.clone();
        state.manifest_hash = previous.manifest_hash.clone();
        state.current_generation = previous.current_generation;
        state.managed_files = previous.managed_files.clone();
        self.write_state(session, &mut state).await
    }

    /// Capture the current on-disk state of every managed file. Files that
    /// do not exist are left out of the baseline.
    pub async fn snapshot_files(
        &self,
        session: &dyn RemoteSession,
        managed: &[ManagedFile],
    ) -> FleetResult<BTreeMap<String, FileState>> {
        let mut files = BTreeMap::new();

        for file in managed {
            match inspect_file(session, &file.path).await? {
                Some(mut found) => {
                    found.restart_units = file.restart_units.clone();
                    files.insert(file.path.clone(), found);
                }
                None => {
                    warn!(host = %session.target().addr, path = %file.path, "managed file missing after apply");
                }
            }
        }

        Ok(files)
    }

    pub async fn record_baseline(
        &self,
        session: &dyn RemoteSession,
        files: BTreeMap<String, FileState>,
    ) -> FleetResult<()> {
        let mut state = self.read_state(session).await?;
        state.managed_files = files;
        state.drift_detected = false;
        state.drift_files.clear();
        self.write_state(session, &mut state).await
    }

    /// Check the recorded baseline and persist the drift verdict.
    pub async fn record_drift(&self, session: &dyn RemoteSession) -> FleetResult<Vec<DriftResult>> {
        let mut state = self.read_state(session).await?;
        let results = self.check_drift(session, &state.managed_files).await?;

        state.drift_files = results
            .iter()
            .filter(|r| r.drifted())
            .map(|r| r.path.clone())
            .collect();
        state.drift_detected = !state.drift_files.is_empty();
        state.last_drift_check = Some(Utc::now());

        self.write_state(session, &mut state).await?;
        Ok(results)
    }

    pub async fn update_reboot_status(
        &self,
        session: &dyn RemoteSession,
        status: &RebootStatus,
    ) -> FleetResult<()> {
        let mut state = self.read_state(session).await?;
        state.reboot_required = status.required;
        state.reboot_packages = status.trigger_packages.clone();
        state.reboot_reason = status.reason.clone();
        self.write_state(session, &mut state).await
    }

    pub async fn record_reboot(&self, session: &dyn RemoteSession) -> FleetResult<()> {
        let mut state = self.read_state(session).await?;
        state.last_reboot = Some(Utc::now());
        state.reboot_required = false;
        state.reboot_packages.clear();
        state.reboot_reason.clear();
        self.write_state(session, &mut state).await
    }
}

/// Hash and metadata of one remote file, `None` if it does not exist.
async fn inspect_file(session: &dyn RemoteSession, path: &str) -> FleetResult<Option<FileState>> {
    let quoted = shell_words::quote(path);

    let hashed = session.exec_sudo(&format!("sha256sum -- {quoted}")).await?;
    if !hashed.success() {
        return Ok(None);
    }
    let hash = hashed
        .stdout
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string();

    let mut state = FileState {
        path: path.to_string(),
        hash,
        ..FileState::default()
    };

    let stat = session
        .exec_sudo(&format!("stat -c '%a %U %G' -- {quoted}"))
        .await?;
    if stat.success() {
        let mut fields = stat.stdout.split_whitespace();
        state.mode = fields.next().unwrap_or_default().to_string();
        state.owner = fields.next().unwrap_or_default().to_string();
        state.group = fields.next().unwrap_or_default().to_string();
    }

    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    fn expected(path: &str, hash: &str, mode: &str) -> FileState {
        FileState {
            path: path.into(),
            hash: hash.into(),
            mode: mode.into(),
            owner: "root".into(),
            group: "root".into(),
            restart_units: vec![],
        }
    }

    fn on_disk(host: &FakeHost, path: &str, hash: &str, stat: &str) {
        host.respond(&format!("sha256sum -- {path}"), 0, &format!("{hash}  {path}\n"));
        host.respond(&format!("stat -c '%a %U %G' -- {path}"), 0, &format!("{stat}\n"));
    }

    #[tokio::test]
    async fn missing_document_reads_as_empty() {
        let host = FakeHost::new("web-1");
        let store = StateStore::default();
        let state = store.read_state(&host).await.unwrap();
        assert_eq!(state, HostState::default());
    }

    #[tokio::test]
    async fn garbage_document_reads_as_empty() {
        let host = FakeHost::new("web-1");
        host.put_file(DEFAULT_STATE_PATH, "not json at all");
        let state = StateStore::default().read_state(&host).await.unwrap();
        assert_eq!(state.state_version, 1);
        assert!(state.manifest_hash.is_empty());
    }

    #[tokio::test]
    async fn unreachable_host_is_an_error() {
        let host = FakeHost::new("web-1");
        host.set_unreachable(true);
        let err = StateStore::default().read_state(&host).await.unwrap_err();
        assert!(matches!(err, FleetError::Connection { .. }));
    }

    #[tokio::test]
    async fn write_then_read_stamps_document() {
        let host = FakeHost::new("web-1");
        let store = StateStore::default();

        let mut state = HostState {
            hostname: "web-1".into(),
            manifest_hash: "sha256-abc".into(),
            ..HostState::default()
        };
        store.write_state(&host, &mut state).await.unwrap();

        let back = store.read_state(&host).await.unwrap();
        assert_eq!(back.manifest_hash, "sha256-abc");
        assert_eq!(back.tool_version, env!("CARGO_PKG_VERSION"));
        assert!(back.updated_at.is_some());
        assert!(host
            .executed()
            .iter()
            .any(|c| c.contains("mv /var/lib/convoy/state.json.tmp /var/lib/convoy/state.json")));
    }

    #[tokio::test]
    async fn drift_classification() {
        let host = FakeHost::new("web-1");
        on_disk(&host, "/etc/a.conf", "aaa", "644 root root");
        on_disk(&host, "/etc/b.conf", "bbb-modified", "644 root root");
        on_disk(&host, "/etc/c.conf", "ccc", "600 root root");
        host.respond("sha256sum -- /etc/d.conf", 1, "");

        let mut want = BTreeMap::new();
        want.insert("/etc/d.conf".to_string(), expected("/etc/d.conf", "ddd", "644"));
        want.insert("/etc/c.conf".to_string(), expected("/etc/c.conf", "ccc", "0644"));
        want.insert("/etc/b.conf".to_string(), expected("/etc/b.conf", "bbb", "644"));
        want.insert("/etc/a.conf".to_string(), expected("/etc/a.conf", "aaa", "0644"));

        let results = StateStore::default().check_drift(&host, &want).await.unwrap();
        let statuses: Vec<_> = results.iter().map(|r| (r.path.as_str(), r.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("/etc/a.conf", DriftStatus::Ok),
                ("/etc/b.conf", DriftStatus::ContentChanged),
                ("/etc/c.conf", DriftStatus::PermissionsChanged),
                ("/etc/d.conf", DriftStatus::Missing),
            ]
        );
        assert!(results[3].actual.is_none());
    }

    #[tokio::test]
    async fn fix_drift_restores_permissions_only() {
        let host = FakeHost::new("web-1");
        let store = StateStore::default();

        let perms = DriftResult {
            path: "/etc/c.conf".into(),
            status: DriftStatus::PermissionsChanged,
            expected: expected("/etc/c.conf", "ccc", "0644"),
            actual: None,
        };
        assert_eq!(store.fix_drift(&host, &perms).await.unwrap(), DriftFix::Restored);
        assert!(host
            .executed()
            .iter()
            .any(|c| c.contains("chmod 0644 /etc/c.conf && chown root:root /etc/c.conf")));

        let content = DriftResult {
            status: DriftStatus::ContentChanged,
            ..perms.clone()
        };
        let before = host.executed().len();
        assert_eq!(
            store.fix_drift(&host, &content).await.unwrap(),
            DriftFix::RequiresReapply
        );
        assert_eq!(host.executed().len(), before);
    }

    #[tokio::test]
    async fn record_drift_persists_verdict() {
        let host = FakeHost::new("web-1");
        let store = StateStore::default();
        on_disk(&host, "/etc/a.conf", "changed", "644 root root");

        let mut files = BTreeMap::new();
        files.insert("/etc/a.conf".to_string(), expected("/etc/a.conf", "aaa", "644"));
        store.record_baseline(&host, files).await.unwrap();

        let results = store.record_drift(&host).await.unwrap();
        assert_eq!(results.len(), 1);

        let state = store.read_state(&host).await.unwrap();
        assert!(state.drift_detected);
        assert_eq!(state.drift_files, vec!["/etc/a.conf"]);
        assert!(state.last_drift_check.is_some());
    }

    #[tokio::test]
    async fn update_after_apply_advances_record() {
        let host = FakeHost::new("web-1");
        let store = StateStore::default();

        let state = store
            .update_after_apply(
                &host,
                &ApplyRecord {
                    hostname: "web-1".into(),
                    base: BaseOs::Nixos,
                    store_path: "/nix/store/xyz-system".into(),
                    manifest_hash: "sha256-xyz".into(),
                    generation: 12,
                    duration: Duration::from_millis(1500),
                },
            )
            .await
            .unwrap();

        assert_eq!(state.current_generation, 12);
        assert_eq!(state.apply_duration, "1.500s");
        assert!(store
            .read_state(&host)
            .await
            .unwrap()
            .is_converged_to("sha256-xyz"));
    }

    #[tokio::test]
    async fn reboot_record_clears_flag() {
        let host = FakeHost::new("web-1");
        let store = StateStore::default();
        store
            .update_reboot_status(
                &host,
                &RebootStatus {
                    required: true,
                    reason: "kernel update".into(),
                    trigger_packages: vec!["linux-image-6.8".into()],
                },
            )
            .await
            .unwrap();
        assert!(store.read_state(&host).await.unwrap().reboot_required);

        store.record_reboot(&host).await.unwrap();
        let state = store.read_state(&host).await.unwrap();
        assert!(!state.reboot_required);
        assert!(state.reboot_packages.is_empty());
        assert!(state.last_reboot.is_some());
    }
}
