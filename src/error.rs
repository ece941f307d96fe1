//! Error taxonomy for the rollout engine.
//!
//! Every per-host failure is a [`FleetError`]; the executor recovers them into
//! host outcomes and only the canary gate or cancellation ends a run early.

use std::time::Duration;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum FleetError {
    /// The host could not be reached or the transport broke mid-command.
    #[error("connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    /// A command that had to succeed exited non-zero.
    #[error("`{command}` on {host} exited with status {exit_code}: {stderr}")]
    Command {
        host: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("build failed for {host}: {reason}")]
    Build { host: String, reason: String },

    #[error("copying closure to {host} failed: {reason}")]
    Transfer { host: String, reason: String },

    #[error("activation failed on {host}: {reason}")]
    Activation { host: String, reason: String },

    #[error("state document on {host}: {reason}")]
    State { host: String, reason: String },

    /// Post-activation checks failed and policy says the host does not count.
    #[error("health checks failed on {host}: {reason}")]
    HealthCheck { host: String, reason: String },

    #[error("reboot of {host} not allowed by configuration")]
    RebootDisallowed { host: String },

    #[error("{host} is outside reboot window {window}, next window starts at {next}")]
    OutsideWindow {
        host: String,
        window: String,
        next: NaiveDateTime,
    },

    #[error("{host} did not come back within {waited:?} after reboot")]
    RebootTimeout { host: String, waited: Duration },

    #[error("{stage} hook failed on {host}: {reason}")]
    Hook {
        host: String,
        stage: &'static str,
        reason: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Serialisable classification of a [`FleetError`], carried in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connection,
    Command,
    Build,
    Transfer,
    Activation,
    State,
    HealthCheck,
    PolicyViolation,
    Timeout,
    Hook,
    Cancelled,
    Config,
    Internal,
}

impl FleetError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FleetError::Connection { .. } => FailureKind::Connection,
            FleetError::Command { .. } => FailureKind::Command,
            FleetError::Build { .. } => FailureKind::Build,
            FleetError::Transfer { .. } => FailureKind::Transfer,
            FleetError::Activation { .. } => FailureKind::Activation,
            FleetError::State { .. } => FailureKind::State,
            FleetError::HealthCheck { .. } => FailureKind::HealthCheck,
            FleetError::RebootDisallowed { .. } | FleetError::OutsideWindow { .. } => {
                FailureKind::PolicyViolation
            }
            FleetError::RebootTimeout { .. } => FailureKind::Timeout,
            FleetError::Hook { .. } => FailureKind::Hook,
            FleetError::Cancelled => FailureKind::Cancelled,
            FleetError::Config(_) => FailureKind::Config,
        }
    }

    /// Policy refusals are reported but never fail a host.
    pub fn is_policy_violation(&self) -> bool {
        self.kind() == FailureKind::PolicyViolation
    }

    pub fn connection(host: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        FleetError::Connection {
            host: host.into(),
            reason: reason.to_string(),
        }
    }
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;
