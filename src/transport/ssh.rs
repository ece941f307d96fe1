//! OpenSSH-backed session pool.
//!
//! Drives the system `ssh` client. Each target gets a ControlMaster socket so
//! repeated commands share one authenticated connection; eviction closes the
//! master.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ExecOutput, RemoteSession, SessionPool, SshTarget};
use crate::error::FleetError;

/// Exit status the ssh client uses for its own failures. A remote command may
/// exit 255 too, so stderr decides.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Messages the ssh client itself prints when it cannot run the command.
const SSH_CLIENT_ERRORS: &[&str] = &[
    "ssh: ",
    "Connection refused",
    "Connection timed out",
    "Connection closed by",
    "Connection reset by",
    "No route to host",
    "Network is unreachable",
    "Could not resolve hostname",
    "Permission denied (",
    "Host key verification failed",
    "kex_exchange_identification",
    "Broken pipe",
    "mux_client",
    "Control socket",
    "ControlSocket",
];

fn is_transport_failure(exit_code: i32, stderr: &str) -> bool {
    exit_code == SSH_TRANSPORT_FAILURE && SSH_CLIENT_ERRORS.iter().any(|m| stderr.contains(m))
}

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub connect_timeout: Duration,
    pub control_dir: PathBuf,
    pub control_persist: Duration,
    pub identity_file: Option<PathBuf>,
    pub strict_host_keys: bool,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            control_dir: std::env::temp_dir().join("convoy-ssh"),
            control_persist: Duration::from_secs(60),
            identity_file: None,
            strict_host_keys: false,
        }
    }
}

pub struct OpenSshPool {
    options: SshOptions,
    identities: HashMap<SshTarget, PathBuf>,
    sessions: Mutex<HashMap<SshTarget, Arc<OpenSshSession>>>,
}

impl OpenSshPool {
    pub fn new(options: SshOptions) -> Self {
        Self {
            options,
            identities: HashMap::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Use a specific key for one target instead of the pool-wide one.
    pub fn with_identity(mut self, target: SshTarget, identity: PathBuf) -> Self {
        self.identities.insert(target, identity);
        self
    }

    fn control_path(&self, target: &SshTarget) -> PathBuf {
        // %C would be shorter but is not available on every client version.
        let name = format!("{}-{}-{}", target.user, target.addr, target.port)
            .replace(['/', ':'], "_");
        self.options.control_dir.join(name)
    }

    fn base_args(&self, target: &SshTarget) -> Vec<String> {
        let control_path = self.control_path(target);
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
            "-o".to_string(),
            format!("ControlPersist={}", self.options.control_persist.as_secs()),
            "-o".to_string(),
            format!(
                "StrictHostKeyChecking={}",
                if self.options.strict_host_keys { "yes" } else { "accept-new" }
            ),
            "-p".to_string(),
            target.port.to_string(),
        ];

        let identity = self
            .identities
            .get(target)
            .or(self.options.identity_file.as_ref());
        if let Some(identity) = identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }

        args
    }
}

#[async_trait]
impl SessionPool for OpenSshPool {
    async fn session(&self, target: &SshTarget) -> Result<Arc<dyn RemoteSession>, FleetError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(target) {
            return Ok(existing.clone());
        }

        ensure_control_dir(&self.options.control_dir, target)?;

        let session = Arc::new(OpenSshSession {
            target: target.clone(),
            args: self.base_args(target),
        });
        sessions.insert(target.clone(), session.clone());
        debug!(target = %target, "opened pooled ssh session");
        Ok(session)
    }

    async fn evict(&self, target: &SshTarget) {
        let removed = self.sessions.lock().await.remove(target);
        if removed.is_none() {
            return;
        }

        let control_path = self.control_path(target);
        let result = Command::new("ssh")
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg("-p")
            .arg(target.port.to_string())
            .arg(format!("{}@{}", target.user, target.addr))
            .output()
            .await;

        match result {
            Ok(_) => debug!(target = %target, "closed ssh control master"),
            Err(e) => warn!(target = %target, error = %e, "failed to close ssh control master"),
        }
    }
}

fn ensure_control_dir(dir: &Path, target: &SshTarget) -> Result<(), FleetError> {
    std::fs::create_dir_all(dir).map_err(|e| {
        FleetError::connection(
            target.to_string(),
            format!("creating control directory {}: {e}", dir.display()),
        )
    })
}

pub struct OpenSshSession {
    target: SshTarget,
    args: Vec<String>,
}

#[async_trait]
impl RemoteSession for OpenSshSession {
    fn target(&self) -> &SshTarget {
        &self.target
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, FleetError> {
        let output = Command::new("ssh")
            .args(&self.args)
            .arg(format!("{}@{}", self.target.user, self.target.addr))
            .arg("--")
            .arg(command)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| FleetError::connection(self.target.addr.clone(), format!("spawning ssh: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let Some(exit_code) = output.status.code() else {
            return Err(FleetError::connection(
                self.target.addr.clone(),
                "ssh terminated by signal",
            ));
        };

        if is_transport_failure(exit_code, &stderr) {
            return Err(FleetError::connection(
                self.target.addr.clone(),
                stderr.trim().to_string(),
            ));
        }

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
            exit_code,
        })
    }
}
