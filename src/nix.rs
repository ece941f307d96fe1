//! Build and copy host closures with the local `nix` CLI.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::host::{BaseOs, DesiredState, Host, ManagedFile};
use crate::error::FleetError;

/// Relative path inside a built closure listing the files it manages.
const MANAGED_FILES_LIST: &str = "etc/convoy/managed-files";

#[async_trait]
pub trait Builder: Send + Sync {
    /// Build the artifact for one host and describe it.
    async fn build_host(&self, name: &str, base: BaseOs) -> Result<DesiredState, FleetError>;

    /// Total closure size in bytes.
    async fn closure_size(&self, store_path: &str) -> Result<u64, FleetError>;
}

#[async_trait]
pub trait Transfer: Send + Sync {
    async fn copy_to_host(&self, desired: &DesiredState, host: &Host) -> Result<(), FleetError>;
}

pub struct NixStore {
    nix_bin: PathBuf,
    flake: String,
    ssh_identity: Option<PathBuf>,
}

impl NixStore {
    /// Locate `nix` and bind to a flake reference.
    pub fn detect(flake: impl Into<String>) -> Result<Self, FleetError> {
        let nix_bin = find_nix().ok_or_else(|| {
            FleetError::Config("nix not found in PATH or well-known locations".to_string())
        })?;
        debug!(nix = %nix_bin.display(), "using nix binary");
        Ok(Self {
            nix_bin,
            flake: flake.into(),
            ssh_identity: None,
        })
    }

    pub fn with_ssh_identity(mut self, identity: Option<PathBuf>) -> Self {
        self.ssh_identity = identity;
        self
    }

    async fn nix(&self, args: &[&str], host: &str) -> Result<String, String> {
        let output = Command::new(&self.nix_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| format!("running nix: {e}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(host, args = ?args, "nix command failed");
            return Err(stderr.trim().to_string());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn manifest_hash(&self, store_path: &str, host: &str) -> String {
        match self.nix(&["path-info", "--json", store_path], host).await {
            Ok(json) => match path_info_field(&json, store_path, "narHash") {
                Some(Value::String(hash)) => return hash,
                _ => warn!(host, "path-info carried no narHash, hashing store path"),
            },
            Err(e) => warn!(host, error = %e, "nix path-info failed, hashing store path"),
        }
        format!("sha256:{:x}", Sha256::digest(store_path.as_bytes()))
    }
}

pub fn attribute_for(name: &str, base: BaseOs) -> Option<String> {
    match base {
        BaseOs::Nixos => Some(format!(
            "nixosConfigurations.{name}.config.system.build.toplevel"
        )),
        BaseOs::Ubuntu => Some(format!("convoyConfigurations.{name}.system")),
        BaseOs::Unknown => None,
    }
}

#[async_trait]
impl Builder for NixStore {
    async fn build_host(&self, name: &str, base: BaseOs) -> Result<DesiredState, FleetError> {
        let attr = attribute_for(name, base).ok_or_else(|| FleetError::Build {
            host: name.to_string(),
            reason: format!("no build target for base '{base}'"),
        })?;
        let flake_ref = format!("{}#{}", self.flake, attr);

        let stdout = self
            .nix(&["build", "--no-link", "--print-out-paths", &flake_ref], name)
            .await
            .map_err(|reason| FleetError::Build {
                host: name.to_string(),
                reason,
            })?;

        let store_path = stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| FleetError::Build {
                host: name.to_string(),
                reason: format!("nix build printed no output path for {flake_ref}"),
            })?
            .to_string();

        let manifest_hash = self.manifest_hash(&store_path, name).await;
        let managed_files = read_managed_files(Path::new(&store_path)).await;

        Ok(DesiredState {
            store_path,
            manifest_hash,
            managed_files,
        })
    }

    async fn closure_size(&self, store_path: &str) -> Result<u64, FleetError> {
        let json = self
            .nix(&["path-info", "-S", "--json", store_path], store_path)
            .await
            .map_err(|reason| FleetError::Build {
                host: store_path.to_string(),
                reason,
            })?;

        path_info_field(&json, store_path, "closureSize")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| FleetError::Build {
                host: store_path.to_string(),
                reason: "path-info carried no closureSize".to_string(),
            })
    }
}

#[async_trait]
impl Transfer for NixStore {
    async fn copy_to_host(&self, desired: &DesiredState, host: &Host) -> Result<(), FleetError> {
        let mut cmd = Command::new(&self.nix_bin);
        cmd.arg("copy")
            .arg("--to")
            .arg(copy_uri(host))
            .arg(&desired.store_path);

        let identity = host.identity_file.as_deref().or(self.ssh_identity.as_deref());
        if let Some(opts) = ssh_opts(host, identity) {
            cmd.env("NIX_SSHOPTS", opts);
        }

        let output = cmd.output().await.map_err(|e| FleetError::Transfer {
            host: host.name.clone(),
            reason: format!("running nix copy: {e}"),
        })?;

        if !output.status.success() {
            return Err(FleetError::Transfer {
                host: host.name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Store URI for `nix copy`. The port travels in `NIX_SSHOPTS`; older nix
/// releases reject `host:port` here.
pub fn copy_uri(host: &Host) -> String {
    format!("ssh://{}@{}", host.ssh_user, host.addr)
}

/// Extra ssh flags for `nix copy`, if any are needed.
pub fn ssh_opts(host: &Host, identity: Option<&Path>) -> Option<String> {
    let mut opts = Vec::new();
    if host.ssh_port != 22 {
        opts.push(format!("-p {}", host.ssh_port));
    }
    if let Some(identity) = identity {
        opts.push(format!("-i {}", shell_words::quote(&identity.display().to_string())));
    }
    (!opts.is_empty()).then(|| opts.join(" "))
}

/// `nix path-info --json` prints an array on older releases and an object
/// keyed by store path on newer ones.
fn path_info_field(json: &str, store_path: &str, field: &str) -> Option<Value> {
    let parsed: Value = serde_json::from_str(json).ok()?;
    let entry = match &parsed {
        Value::Array(items) => items.first()?,
        Value::Object(map) => map.get(store_path).or_else(|| map.values().next())?,
        _ => return None,
    };
    entry.get(field).cloned()
}

/// Each line is `path [unit ...]`. A closure without the list manages nothing.
pub fn parse_managed_files(body: &str) -> Vec<ManagedFile> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let path = fields.next()?.to_string();
            Some(ManagedFile {
                path,
                restart_units: fields.map(str::to_string).collect(),
            })
        })
        .collect()
}

async fn read_managed_files(store_path: &Path) -> Vec<ManagedFile> {
    match tokio::fs::read_to_string(store_path.join(MANAGED_FILES_LIST)).await {
        Ok(body) => parse_managed_files(&body),
        Err(_) => Vec::new(),
    }
}

fn find_nix() -> Option<PathBuf> {
    if let Some(path) = find_in_path("nix") {
        return Some(path);
    }

    let well_known = [
        "/nix/var/nix/profiles/default/bin/nix",
        "/run/current-system/sw/bin/nix",
    ];
    for location in &well_known {
        let path = PathBuf::from(location);
        if path.exists() {
            return Some(path);
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".nix-profile/bin/nix"))
        .filter(|path| path.exists())
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::host;

    #[test]
    fn build_attributes() {
        assert_eq!(
            attribute_for("web-1", BaseOs::Nixos).as_deref(),
            Some("nixosConfigurations.web-1.config.system.build.toplevel")
        );
        assert_eq!(
            attribute_for("app-1", BaseOs::Ubuntu).as_deref(),
            Some("convoyConfigurations.app-1.system")
        );
        assert_eq!(attribute_for("x", BaseOs::Unknown), None);
    }

    #[test]
    fn path_info_array_and_object() {
        let array = r#"[{"path":"/nix/store/abc-sys","narHash":"sha256-AAA","closureSize":42}]"#;
        let object = r#"{"/nix/store/abc-sys":{"narHash":"sha256-BBB","closureSize":7}}"#;

        assert_eq!(
            path_info_field(array, "/nix/store/abc-sys", "narHash"),
            Some(Value::String("sha256-AAA".into()))
        );
        assert_eq!(
            path_info_field(object, "/nix/store/abc-sys", "closureSize").and_then(|v| v.as_u64()),
            Some(7)
        );
        assert_eq!(path_info_field("not json", "/x", "narHash"), None);
    }

    #[test]
    fn managed_file_list() {
        let files = parse_managed_files(
            "# generated\n/etc/nginx/nginx.conf nginx.service\n\n/etc/motd\n",
        );
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].restart_units, vec!["nginx.service"]);
        assert!(files[1].restart_units.is_empty());
    }

    #[test]
    fn non_default_port_goes_through_sshopts() {
        let mut h = host("web-1", BaseOs::Ubuntu);
        assert_eq!(copy_uri(&h), "ssh://root@web-1.test");
        assert_eq!(ssh_opts(&h, None), None);

        h.ssh_port = 2222;
        assert_eq!(copy_uri(&h), "ssh://root@web-1.test");
        assert_eq!(ssh_opts(&h, None).as_deref(), Some("-p 2222"));
        assert_eq!(
            ssh_opts(&h, Some(Path::new("/keys/fleet"))).as_deref(),
            Some("-p 2222 -i /keys/fleet")
        );
    }
}
