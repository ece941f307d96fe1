//! Host model: what the engine knows about one managed machine.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::window::RebootWindow;
use crate::transport::SshTarget;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseOs {
    Ubuntu,
    Nixos,
    #[default]
    #[serde(other)]
    Unknown,
}

impl FromStr for BaseOs {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ubuntu" => Ok(BaseOs::Ubuntu),
            "nixos" => Ok(BaseOs::Nixos),
            _ => Err(format!("unknown base OS: {s} (expected ubuntu or nixos)")),
        }
    }
}

impl fmt::Display for BaseOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseOs::Ubuntu => write!(f, "ubuntu"),
            BaseOs::Nixos => write!(f, "nixos"),
            BaseOs::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub base: BaseOs,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub rollout: RolloutPolicy,
    #[serde(default, alias = "os_updates")]
    pub os_update: OsUpdatePolicy,
}

impl Host {
    pub fn target(&self) -> SshTarget {
        SshTarget {
            addr: self.addr.clone(),
            port: self.ssh_port,
            user: self.ssh_user.clone(),
        }
    }
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

// ── Policies ────────────────────────────────────────────────

/// Per-host rollout overrides. Unset fields inherit the fleet configuration;
/// a set field can only make a rollout more cautious.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary_percent: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_between_batches_secs: Option<u64>,
}

/// How the host takes OS package updates. convoy records this but never
/// installs packages itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateMode {
    #[default]
    SecurityDaily,
    FullWeekly,
    Manual,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsUpdatePolicy {
    #[serde(default)]
    pub mode: UpdateMode,
    #[serde(default, alias = "auto_reboot")]
    pub allow_reboot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_window: Option<RebootWindow>,
    /// Caps the fleet-wide reboot limiter for any run that includes this host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_reboots: Option<usize>,
    /// Packages pinned at their current version.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub holds: Vec<String>,
}

// ── Desired state ───────────────────────────────────────────

/// A file the built artifact manages, with the units to restart when it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restart_units: Vec<String>,
}

/// Output of the build step for one host.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    pub store_path: String,
    pub manifest_hash: String,
    #[serde(default)]
    pub managed_files: Vec<ManagedFile>,
}

impl PartialEq for DesiredState {
    fn eq(&self, other: &Self) -> bool {
        self.manifest_hash == other.manifest_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_host_gets_defaults() {
        let host: Host = serde_yaml::from_str("name: web-1\naddr: 10.0.0.1\n").unwrap();
        assert_eq!(host.base, BaseOs::Unknown);
        assert_eq!(host.ssh_port, 22);
        assert_eq!(host.rollout, RolloutPolicy::default());
        assert_eq!(host.os_update.max_concurrent_reboots, None);
        assert!(!host.os_update.allow_reboot);
        assert_eq!(host.target().to_string(), "root@10.0.0.1:22");
    }

    #[test]
    fn unknown_base_and_auto_reboot_alias() {
        let yaml = r#"
name: db-1
addr: db-1.internal
base: debian
ssh_user: deploy
os_updates:
  mode: full-weekly
  auto_reboot: true
  reboot_window: "Sun 02:00-04:00"
  holds: [postgresql-16]
  max_concurrent_reboots: 2
rollout:
  max_parallel: 1
"#;
        let host: Host = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(host.base, BaseOs::Unknown);
        assert_eq!(host.os_update.mode, UpdateMode::FullWeekly);
        assert!(host.os_update.allow_reboot);
        assert_eq!(
            host.os_update.reboot_window.map(|w| w.to_string()).as_deref(),
            Some("Sun 02:00-04:00")
        );
        assert_eq!(host.os_update.holds, vec!["postgresql-16"]);
        assert_eq!(host.os_update.max_concurrent_reboots, Some(2));
        assert_eq!(host.rollout.max_parallel, Some(1));
        assert_eq!(host.rollout.canary_percent, None);
    }

    #[test]
    fn desired_state_equality_is_hash_equality() {
        let a = DesiredState {
            store_path: "/nix/store/aaa-system".into(),
            manifest_hash: "sha256-x".into(),
            managed_files: vec![],
        };
        let b = DesiredState {
            store_path: "/nix/store/bbb-system".into(),
            ..a.clone()
        };
        assert_eq!(a, b);
    }
}
