//! Session state and the caller-visible status snapshot.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{LifecycleStatus, LifecycleUpdate, SessionRecord};
use crate::error::FailureInfo;

/// Lifecycle state of one agent's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    QrPending,
    Connected,
    ClosedRecoverable,
    Conflict,
    Disconnected,
    FatalError,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Uninitialized => "UNINITIALIZED",
            SessionState::Initializing => "INITIALIZING",
            SessionState::QrPending => "QR_PENDING",
            SessionState::Connected => "CONNECTED",
            SessionState::ClosedRecoverable => "CLOSED_RECOVERABLE",
            SessionState::Conflict => "CONFLICT",
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::FatalError => "FATAL_ERROR",
        }
    }

    /// Coarse status mirrored into the durable record. States that discard
    /// the session have none.
    pub fn lifecycle_status(&self) -> Option<LifecycleStatus> {
        match self {
            SessionState::Initializing | SessionState::ClosedRecoverable => {
                Some(LifecycleStatus::Connecting)
            }
            SessionState::QrPending => Some(LifecycleStatus::QrPending),
            SessionState::Connected => Some(LifecycleStatus::Connected),
            SessionState::Conflict => Some(LifecycleStatus::Conflict),
            SessionState::Disconnected => Some(LifecycleStatus::Disconnected),
            SessionState::Uninitialized | SessionState::FatalError => None,
        }
    }

    /// Whether the session is actively trying to hold a connection.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Initializing
                | SessionState::QrPending
                | SessionState::Connected
                | SessionState::ClosedRecoverable
        )
    }

    /// Whether a `start()` may replace a session in this state.
    pub fn is_parked(&self) -> bool {
        matches!(
            self,
            SessionState::Uninitialized
                | SessionState::Conflict
                | SessionState::Disconnected
                | SessionState::FatalError
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An issued pairing code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingCode {
    pub code: String,
    pub issued_at: DateTime<Utc>,
}

impl PairingCode {
    pub fn is_expired(&self, validity: Duration, now: DateTime<Utc>) -> bool {
        code_expired(self.issued_at, validity, now)
    }
}

fn code_expired(issued_at: DateTime<Utc>, validity: Duration, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(validity) {
        Ok(validity) => now - issued_at >= validity,
        Err(_) => false,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCounters {
    /// Consecutive failed connections since the last successful open.
    pub reconnect: u32,
    /// Pairing codes issued in the current pairing flow.
    pub pairing_codes: u32,
}

/// In-memory session, mutated only by its driver.
#[derive(Debug, Clone)]
pub struct Session {
    pub agent_id: String,
    state: SessionState,
    pub identity: Option<String>,
    pub pairing_code: Option<PairingCode>,
    pub failure: Option<FailureInfo>,
    pub connected_at: Option<DateTime<Utc>>,
    pub attempts: AttemptCounters,
}

impl Session {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            state: SessionState::Uninitialized,
            identity: None,
            pairing_code: None,
            failure: None,
            connected_at: None,
            attempts: AttemptCounters::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`. Leaving QR_PENDING always clears the pairing code.
    pub fn enter(&mut self, next: SessionState) {
        if next != SessionState::QrPending {
            self.pairing_code = None;
            if self.state == SessionState::QrPending {
                self.attempts.pairing_codes = 0;
            }
        }
        self.state = next;
    }

    /// Durable lifecycle write for the current state, if it has one.
    pub fn lifecycle_update(&self) -> Option<LifecycleUpdate> {
        let status = self.state.lifecycle_status()?;
        let mut update = LifecycleUpdate::new(status, self.state.is_active());
        update.identity = self.identity.clone();
        update.pairing_code = self
            .pairing_code
            .as_ref()
            .map(|p| (p.code.clone(), p.issued_at));
        update.failure = self.failure.clone();
        if self.state == SessionState::Connected {
            update.connected_at = self.connected_at;
        }
        Some(update)
    }

    /// Snapshot for callers. A pairing code past its validity is never
    /// included.
    pub fn status(&self, pairing_code_validity: Duration, now: DateTime<Utc>) -> SessionStatus {
        let pairing_code = match (&self.pairing_code, self.state) {
            (Some(code), SessionState::QrPending) if !code.is_expired(pairing_code_validity, now) => {
                Some(code.clone())
            }
            _ => None,
        };
        SessionStatus {
            agent_id: self.agent_id.clone(),
            state: self.state,
            identity: self.identity.clone(),
            pairing_code: pairing_code.as_ref().map(|p| p.code.clone()),
            pairing_code_issued_at: pairing_code.map(|p| p.issued_at),
            failure: self.failure.clone(),
            connected_at: self.connected_at,
            retry_after: None,
            attempts: self.attempts,
        }
    }
}

/// Coherent view of a session returned by the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub agent_id: String,
    pub state: SessionState,
    pub identity: Option<String>,
    pub pairing_code: Option<String>,
    pub pairing_code_issued_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureInfo>,
    pub connected_at: Option<DateTime<Utc>>,
    /// Remaining cooldown, when one is armed.
    #[serde(with = "opt_secs")]
    pub retry_after: Option<Duration>,
    pub attempts: AttemptCounters,
}

impl SessionStatus {
    /// Drop a pairing code that expired after this snapshot was taken.
    pub fn without_expired_code(mut self, validity: Duration, now: DateTime<Utc>) -> Self {
        let expired = self
            .pairing_code_issued_at
            .is_some_and(|issued_at| code_expired(issued_at, validity, now));
        if expired || self.state != SessionState::QrPending {
            self.pairing_code = None;
            self.pairing_code_issued_at = None;
        }
        self
    }

    /// Status of an agent without a live session, from its durable record.
    pub fn from_record(agent_id: &str, record: Option<&SessionRecord>) -> Self {
        let state = match record.map(|r| r.status) {
            Some(LifecycleStatus::Conflict) => SessionState::Conflict,
            Some(LifecycleStatus::Disconnected) => SessionState::Disconnected,
            _ => SessionState::Uninitialized,
        };
        SessionStatus {
            agent_id: agent_id.to_string(),
            state,
            identity: record.and_then(|r| r.identity.clone()),
            pairing_code: None,
            pairing_code_issued_at: None,
            failure: record.and_then(|r| r.failure.clone()),
            connected_at: record.and_then(|r| r.connected_at),
            retry_after: None,
            attempts: AttemptCounters::default(),
        }
    }
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const VALIDITY: Duration = Duration::from_secs(60);

    fn pending(issued_secs_ago: i64) -> Session {
        let mut session = Session::new("A1");
        session.enter(SessionState::Initializing);
        session.enter(SessionState::QrPending);
        session.pairing_code = Some(PairingCode {
            code: "Q-0001".to_string(),
            issued_at: Utc::now() - chrono::Duration::seconds(issued_secs_ago),
        });
        session
    }

    #[test]
    fn test_leaving_qr_pending_clears_code() {
        let mut session = pending(0);
        session.enter(SessionState::Connected);
        assert!(session.pairing_code.is_none());
        let status = session.status(VALIDITY, Utc::now());
        assert_eq!(status.state, SessionState::Connected);
        assert_eq!(status.pairing_code, None);
    }

    #[test]
    fn test_expired_code_is_hidden() {
        let fresh = pending(5).status(VALIDITY, Utc::now());
        assert_eq!(fresh.pairing_code.as_deref(), Some("Q-0001"));

        let stale = pending(61).status(VALIDITY, Utc::now());
        assert_eq!(stale.pairing_code, None);

        // A snapshot taken while fresh is filtered again when served late.
        let served = fresh.without_expired_code(VALIDITY, Utc::now() + chrono::Duration::seconds(90));
        assert_eq!(served.pairing_code, None);
    }

    #[test]
    fn test_lifecycle_mapping() {
        assert_eq!(
            SessionState::ClosedRecoverable.lifecycle_status(),
            Some(LifecycleStatus::Connecting)
        );
        assert_eq!(SessionState::FatalError.lifecycle_status(), None);
        assert!(!SessionState::Conflict.is_active());

        let update = pending(0).lifecycle_update().unwrap();
        assert_eq!(update.status, LifecycleStatus::QrPending);
        assert!(update.active);
        assert_eq!(update.pairing_code.map(|(c, _)| c).as_deref(), Some("Q-0001"));
    }

    #[test]
    fn test_status_from_record() {
        let mut record = SessionRecord::new("A1", LifecycleStatus::Connected);
        record.identity = Some("+15551234567".to_string());
        let status = SessionStatus::from_record("A1", Some(&record));
        assert_eq!(status.state, SessionState::Uninitialized);
        assert_eq!(status.identity.as_deref(), Some("+15551234567"));

        record.status = LifecycleStatus::Conflict;
        assert_eq!(
            SessionStatus::from_record("A1", Some(&record)).state,
            SessionState::Conflict
        );
        assert_eq!(
            SessionStatus::from_record("A9", None).state,
            SessionState::Uninitialized
        );
    }
}
