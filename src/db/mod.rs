//! Durable record store.
//!
//! Holds one session record per agent (lifecycle, pairing code, ownership,
//! failure) plus the credential mirror and the ingested message records.
//! Uniqueness of `(agent_id, external_id)` on message records is enforced by
//! the store and is the final authority on duplicates.

mod memory;
mod postgres;

pub use memory::MemoryDatabase;
pub use postgres::PgDatabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DatabaseError, FailureInfo};
use crate::ingest::MessageContent;

/// Coarse lifecycle status shared across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Connecting,
    QrPending,
    Connected,
    Conflict,
    Disconnected,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Connecting => "connecting",
            LifecycleStatus::QrPending => "qr_pending",
            LifecycleStatus::Connected => "connected",
            LifecycleStatus::Conflict => "conflict",
            LifecycleStatus::Disconnected => "disconnected",
        }
    }

    /// Whether credential material may be reused under this status.
    pub fn allows_credential_reuse(&self) -> bool {
        !matches!(
            self,
            LifecycleStatus::Conflict | LifecycleStatus::Disconnected
        )
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LifecycleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connecting" => Ok(LifecycleStatus::Connecting),
            "qr_pending" => Ok(LifecycleStatus::QrPending),
            "connected" => Ok(LifecycleStatus::Connected),
            "conflict" => Ok(LifecycleStatus::Conflict),
            "disconnected" => Ok(LifecycleStatus::Disconnected),
            other => Err(format!("unknown lifecycle status '{}'", other)),
        }
    }
}

/// Identity of a process instance driving an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerIdentity {
    pub instance_id: Uuid,
    pub host: String,
    pub pid: u32,
}

/// Durable per-agent session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub agent_id: String,
    pub status: LifecycleStatus,
    pub active: bool,
    pub identity: Option<String>,
    pub pairing_code: Option<String>,
    pub pairing_code_issued_at: Option<DateTime<Utc>>,
    pub owner: Option<OwnerIdentity>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureInfo>,
    pub connected_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Empty record for an agent seen for the first time.
    pub fn new(agent_id: impl Into<String>, status: LifecycleStatus) -> Self {
        Self {
            agent_id: agent_id.into(),
            status,
            active: false,
            identity: None,
            pairing_code: None,
            pairing_code_issued_at: None,
            owner: None,
            last_heartbeat_at: None,
            failure: None,
            connected_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Apply a lifecycle update in place.
    pub fn apply(&mut self, update: &LifecycleUpdate) {
        self.status = update.status;
        self.active = update.active;
        if let Some(identity) = &update.identity {
            self.identity = Some(identity.clone());
        }
        match &update.pairing_code {
            Some((code, issued_at)) => {
                self.pairing_code = Some(code.clone());
                self.pairing_code_issued_at = Some(*issued_at);
            }
            None => {
                self.pairing_code = None;
                self.pairing_code_issued_at = None;
            }
        }
        self.failure = update.failure.clone();
        if update.connected_at.is_some() {
            self.connected_at = update.connected_at;
        }
        self.updated_at = Utc::now();
    }
}

/// A lifecycle write. The pairing code and failure are always written (None
/// clears them); identity and connection time only overwrite when set.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleUpdate {
    pub status: LifecycleStatus,
    pub active: bool,
    pub identity: Option<String>,
    pub pairing_code: Option<(String, DateTime<Utc>)>,
    pub failure: Option<FailureInfo>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl LifecycleUpdate {
    pub fn new(status: LifecycleStatus, active: bool) -> Self {
        Self {
            status,
            active,
            identity: None,
            pairing_code: None,
            failure: None,
            connected_at: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn with_pairing_code(mut self, code: impl Into<String>, issued_at: DateTime<Utc>) -> Self {
        self.pairing_code = Some((code.into(), issued_at));
        self
    }

    pub fn with_failure(mut self, failure: FailureInfo) -> Self {
        self.failure = Some(failure);
        self
    }

    pub fn connected_at(mut self, at: DateTime<Utc>) -> Self {
        self.connected_at = Some(at);
        self
    }
}

/// Direction of a message relative to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "in",
            Direction::Outbound => "out",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::Inbound),
            "out" => Ok(Direction::Outbound),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// Where a message originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    /// Sent through this crate's control surface.
    LocalControl,
    /// Observed on the external network.
    ExternalNetwork,
}

impl MessageOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageOrigin::LocalControl => "local_control",
            MessageOrigin::ExternalNetwork => "external_network",
        }
    }
}

impl std::str::FromStr for MessageOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_control" => Ok(MessageOrigin::LocalControl),
            "external_network" => Ok(MessageOrigin::ExternalNetwork),
            other => Err(format!("unknown origin '{}'", other)),
        }
    }
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    pub agent_id: String,
    pub external_id: Option<String>,
    pub fallback_key: String,
    pub direction: Direction,
    pub origin: MessageOrigin,
    /// The other party of the conversation.
    pub peer: String,
    pub sender: String,
    pub recipient: String,
    pub content: MessageContent,
    pub sent_at: DateTime<Utc>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Result of inserting a message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The store already held a record with the same external id.
    Duplicate,
}

/// Durable store abstraction.
#[async_trait]
pub trait Database: Send + Sync {
    // --- Session records ---

    async fn get_session_record(
        &self,
        agent_id: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError>;

    /// Upsert the lifecycle fields of an agent's record.
    async fn update_lifecycle(
        &self,
        agent_id: &str,
        update: &LifecycleUpdate,
    ) -> Result<(), DatabaseError>;

    /// Write this instance's identity into the ownership fields.
    async fn claim_ownership(
        &self,
        agent_id: &str,
        owner: &OwnerIdentity,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Refresh the heartbeat if `instance_id` still owns the agent.
    async fn touch_heartbeat(
        &self,
        agent_id: &str,
        instance_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Clear ownership fields and the active flag.
    async fn clear_ownership(&self, agent_id: &str) -> Result<(), DatabaseError>;

    // --- Credential mirror ---

    async fn save_credential_mirror(
        &self,
        agent_id: &str,
        payload: &str,
    ) -> Result<(), DatabaseError>;

    async fn load_credential_mirror(&self, agent_id: &str)
    -> Result<Option<String>, DatabaseError>;

    async fn delete_credential_mirror(&self, agent_id: &str) -> Result<(), DatabaseError>;

    // --- Messages ---

    async fn find_message_by_external_id(
        &self,
        agent_id: &str,
        external_id: &str,
    ) -> Result<Option<MessageRecord>, DatabaseError>;

    /// Find a message whose fallback key equals any of `keys`.
    async fn find_message_by_fallback_keys(
        &self,
        agent_id: &str,
        keys: &[String],
    ) -> Result<Option<MessageRecord>, DatabaseError>;

    async fn insert_message(&self, record: &MessageRecord) -> Result<InsertOutcome, DatabaseError>;

    async fn mark_message_read(
        &self,
        agent_id: &str,
        external_id: &str,
    ) -> Result<bool, DatabaseError>;

    async fn list_messages(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError>;
}
