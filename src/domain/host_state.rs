//! The per-host state document, `/var/lib/convoy/state.json`.
//!
//! The document is the only record of convergence the engine trusts. Parsing
//! is tolerant: missing fields take defaults and unknown fields are ignored,
//! so older and newer tool versions can share a host.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::host::BaseOs;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostState {
    pub hostname: String,
    pub base: BaseOs,

    // ── Convergence ──────────────────────────────────────────
    pub current_generation: u64,
    pub manifest_hash: String,
    pub store_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_apply: Option<DateTime<Utc>>,
    pub apply_duration: String,

    // ── Reboot ───────────────────────────────────────────────
    pub reboot_required: bool,
    pub reboot_packages: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reboot_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reboot: Option<DateTime<Utc>>,

    // ── Drift ────────────────────────────────────────────────
    pub managed_files: BTreeMap<String, FileState>,
    pub drift_detected: bool,
    pub drift_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_drift_check: Option<DateTime<Utc>>,

    pub tool_version: String,
    pub state_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            base: BaseOs::Unknown,
            current_generation: 0,
            manifest_hash: String::new(),
            store_path: String::new(),
            last_apply: None,
            apply_duration: String::new(),
            reboot_required: false,
            reboot_packages: Vec::new(),
            reboot_reason: String::new(),
            last_reboot: None,
            managed_files: BTreeMap::new(),
            drift_detected: false,
            drift_files: Vec::new(),
            last_drift_check: None,
            tool_version: String::new(),
            state_version: STATE_VERSION,
            updated_at: None,
        }
    }
}

impl HostState {
    /// Whether this host already runs the artifact identified by `hash`.
    /// An empty recorded hash never matches.
    pub fn is_converged_to(&self, hash: &str) -> bool {
        !self.manifest_hash.is_empty() && self.manifest_hash == hash
    }

    /// One-line human readable description for `convoy status`.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();

        if self.manifest_hash.is_empty() {
            parts.push("never applied".to_string());
        } else {
            parts.push(format!(
                "gen {} ({})",
                self.current_generation,
                short_hash(&self.manifest_hash)
            ));
        }

        if let Some(at) = self.last_apply {
            parts.push(format!("applied {}", at.format("%Y-%m-%d %H:%M UTC")));
        }

        if self.reboot_required {
            if self.reboot_packages.is_empty() {
                parts.push("reboot required".to_string());
            } else {
                parts.push(format!(
                    "reboot required ({})",
                    self.reboot_packages.join(", ")
                ));
            }
        }

        if self.drift_detected {
            parts.push(format!("drift in {} file(s)", self.drift_files.len()));
        }

        parts.join(", ")
    }
}

fn short_hash(hash: &str) -> &str {
    let body = hash.split_once(['-', ':']).map_or(hash, |(_, rest)| rest);
    body.get(..12).unwrap_or(body)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileState {
    pub path: String,
    pub hash: String,
    pub mode: String,
    pub owner: String,
    pub group: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub restart_units: Vec<String>,
}

impl FileState {
    /// Mode strings compare equal regardless of leading zeros ("0644" == "644").
    pub fn same_mode(&self, other: &FileState) -> bool {
        normalize_mode(&self.mode) == normalize_mode(&other.mode)
    }

    pub fn same_metadata(&self, other: &FileState) -> bool {
        self.same_mode(other) && self.owner == other.owner && self.group == other.group
    }
}

fn normalize_mode(mode: &str) -> &str {
    let trimmed = mode.trim().trim_start_matches('0');
    if trimmed.is_empty() {
        "0"
    } else {
        trimmed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    Ok,
    Missing,
    ContentChanged,
    PermissionsChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftResult {
    pub path: String,
    pub status: DriftStatus,
    pub expected: FileState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<FileState>,
}

impl DriftResult {
    pub fn drifted(&self) -> bool {
        self.status != DriftStatus::Ok
    }
}
