//! Error types for every subsystem.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::CloseSignal;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Durable store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(err.to_string())
    }
}

impl From<tokio_postgres::Error> for DatabaseError {
    fn from(err: tokio_postgres::Error) -> Self {
        DatabaseError::Query(err.to_string())
    }
}

/// Reasons credential material fails integrity validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityError {
    #[error("required key '{0}' is missing")]
    MissingKey(&'static str),

    #[error("key '{key}' has length {actual}, expected {expected}")]
    WrongLength {
        key: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("registration id is zero")]
    MissingRegistration,
}

/// Credential vault errors.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Invalid agent id '{0}'")]
    InvalidAgentId(String),

    #[error("Persisted credential material for {agent_id} is corrupted: {reason}")]
    Corrupted { agent_id: String, reason: String },

    #[error("Timed out waiting for credential lock of {agent_id}")]
    LockTimeout { agent_id: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors raised at the transport boundary.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Handshake failed: {reason}")]
    Handshake {
        reason: String,
        signal: Option<CloseSignal>,
    },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String },

    #[error("Transport is not connected")]
    NotConnected,

    #[error("Probe failed: {reason}")]
    ProbeFailed { reason: String },
}

/// Webhook forwarding errors.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Webhook request failed: {0}")]
    Request(String),

    #[error("Webhook returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Webhook delivery gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl From<reqwest::Error> for WebhookError {
    fn from(err: reqwest::Error) -> Self {
        WebhookError::Request(err.to_string())
    }
}

/// Errors returned by the session control surface.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(
        "Agent {agent_id} is owned by instance {owner_instance} on {owner_host} (heartbeat {heartbeat_age_secs}s ago)"
    )]
    OwnershipConflict {
        agent_id: String,
        owner_instance: String,
        owner_host: String,
        heartbeat_age_secs: i64,
    },

    #[error("Agent {agent_id} is cooling down ({reason}); retry in {secs}s", secs = .retry_after.as_secs())]
    Cooldown {
        agent_id: String,
        reason: String,
        retry_after: Duration,
    },

    #[error("Agent {agent_id} is already initializing")]
    InitializationInProgress { agent_id: String },

    #[error("No session for agent {agent_id}")]
    NotFound { agent_id: String },

    #[error("Agent {agent_id} is not connected (state: {state})")]
    NotConnected { agent_id: String, state: String },

    #[error("Session for agent {agent_id} terminated")]
    Terminated { agent_id: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Failure taxonomy carried on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientNetwork,
    RestartRequired,
    CredentialInvalid,
    RateLimited,
    CorruptionDetected,
    OwnershipConflict,
    Unknown,
}

impl FailureKind {
    /// Whether the failure is recovered internally without caller action.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FailureKind::TransientNetwork | FailureKind::RestartRequired | FailureKind::RateLimited
        )
    }

    /// Whether credential material must be discarded.
    pub fn wipes_credentials(&self) -> bool {
        matches!(
            self,
            FailureKind::CredentialInvalid | FailureKind::CorruptionDetected
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::RestartRequired => "restart_required",
            FailureKind::CredentialInvalid => "credential_invalid",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::CorruptionDetected => "corruption_detected",
            FailureKind::OwnershipConflict => "ownership_conflict",
            FailureKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient_network" => Ok(FailureKind::TransientNetwork),
            "restart_required" => Ok(FailureKind::RestartRequired),
            "credential_invalid" => Ok(FailureKind::CredentialInvalid),
            "rate_limited" => Ok(FailureKind::RateLimited),
            "corruption_detected" => Ok(FailureKind::CorruptionDetected),
            "ownership_conflict" => Ok(FailureKind::OwnershipConflict),
            "unknown" => Ok(FailureKind::Unknown),
            other => Err(format!("unknown failure kind '{}'", other)),
        }
    }
}

/// A recorded failure with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl FailureInfo {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}
