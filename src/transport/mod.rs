//! Remote command execution contract.
//!
//! The engine only ever talks to hosts through [`RemoteSession`]; sessions are
//! handed out by a [`SessionPool`] keyed by [`SshTarget`].

pub mod ssh;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;

/// Connection key for a pooled session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SshTarget {
    pub addr: String,
    pub port: u16,
    pub user: String,
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.addr, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`FleetError::Command`].
    pub fn check(self, host: &str, command: &str) -> Result<Self, FleetError> {
        if self.success() {
            Ok(self)
        } else {
            Err(FleetError::Command {
                host: host.to_string(),
                command: command.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn target(&self) -> &SshTarget;

    /// Run a command as the login user. Only transport failures are errors;
    /// a non-zero exit is reported in [`ExecOutput::exit_code`].
    async fn exec(&self, command: &str) -> Result<ExecOutput, FleetError>;

    /// Run a command with root privileges.
    async fn exec_sudo(&self, command: &str) -> Result<ExecOutput, FleetError> {
        let wrapped = format!("sudo -n sh -c {}", shell_words::quote(command));
        self.exec(&wrapped).await
    }
}

#[async_trait]
pub trait SessionPool: Send + Sync {
    /// Return a live session for `target`, connecting if necessary.
    async fn session(&self, target: &SshTarget) -> Result<Arc<dyn RemoteSession>, FleetError>;

    /// Drop any pooled connection for `target`. The next `session` call
    /// reconnects.
    async fn evict(&self, target: &SshTarget);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_display() {
        let target = SshTarget {
            addr: "10.0.0.4".into(),
            port: 2222,
            user: "deploy".into(),
        };
        assert_eq!(target.to_string(), "deploy@10.0.0.4:2222");
    }

    #[test]
    fn check_maps_nonzero_exit() {
        let out = ExecOutput {
            stdout: String::new(),
            stderr: "permission denied\n".into(),
            exit_code: 1,
        };
        match out.check("web-1", "cat /etc/shadow") {
            Err(FleetError::Command {
                exit_code, stderr, ..
            }) => {
                assert_eq!(exit_code, 1);
                assert_eq!(stderr, "permission denied");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
