//! Boundary with the external transport library.
//!
//! The transport performs the cryptographic handshake and speaks the wire
//! protocol. This crate only sees it through [`TransportConnector`], which
//! yields a live [`Transport`] handle plus a stream of [`TransportEvent`]s.

#[cfg(test)]
pub(crate) mod scripted;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::vault::CredentialMaterial;

/// Close status codes reported by the external network.
pub mod codes {
    pub const LOGGED_OUT: u16 = 401;
    pub const FORBIDDEN: u16 = 403;
    pub const TIMED_OUT: u16 = 408;
    pub const DEVICE_MISMATCH: u16 = 411;
    pub const CONNECTION_CLOSED: u16 = 428;
    pub const RATE_LIMITED: u16 = 429;
    pub const CONNECTION_REPLACED: u16 = 440;
    pub const BAD_SESSION: u16 = 500;
    pub const UNAVAILABLE: u16 = 503;
    pub const RESTART_REQUIRED: u16 = 515;
}

/// A close signal as reported by the transport.
///
/// The same numeric code is reused by the network for unrelated conditions,
/// so the reason text is kept alongside it for classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSignal {
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseSignal {
    pub fn new(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn with_code(code: u16, reason: impl Into<String>) -> Self {
        Self::new(Some(code), reason)
    }

    pub fn restart_required() -> Self {
        Self::with_code(codes::RESTART_REQUIRED, "restart required")
    }

    pub fn logged_out() -> Self {
        Self::with_code(codes::LOGGED_OUT, "logged out")
    }

    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::with_code(codes::TIMED_OUT, reason)
    }
}

impl std::fmt::Display for CloseSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({})", self.reason, code),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// A message event exactly as the transport delivered it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Externally assigned message id, when the origin path provides one.
    pub id: Option<String>,
    /// Chat the message belongs to.
    pub remote: String,
    /// Sender inside a multi-party chat.
    pub participant: Option<String>,
    /// Sent by this agent's own identity.
    pub from_me: bool,
    pub timestamp: DateTime<Utc>,
    pub push_name: Option<String>,
    /// Protocol attributes, e.g. phone-number aliases for linked-device ids.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Message body in the transport's own shape.
    pub payload: serde_json::Value,
}

/// Events emitted by a live transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Session is authenticated and open.
    Opened { identity: String },
    /// Connection closed.
    Closed(CloseSignal),
    /// A pairing code must be shown to link this device.
    PairingCodeIssued(String),
    /// Credential material changed and must be persisted.
    CredentialUpdated(CredentialMaterial),
    /// A message was sent or received on the account.
    MessageReceived(RawMessage),
}

/// Kinds of media attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Sticker => "sticker",
        }
    }
}

/// Content sent through the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingContent {
    Text {
        body: String,
    },
    Media {
        kind: MediaKind,
        url: String,
        caption: Option<String>,
    },
}

impl OutgoingContent {
    pub fn text(body: impl Into<String>) -> Self {
        OutgoingContent::Text { body: body.into() }
    }
}

/// Acknowledgement of a sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

/// A live transport handle.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send content to a target address.
    async fn send(
        &self,
        target: &str,
        content: &OutgoingContent,
    ) -> Result<SendReceipt, TransportError>;

    /// Round-trip a keepalive. Transports without one report healthy.
    async fn probe(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Unlink this device from the account.
    async fn logout(&self) -> Result<(), TransportError>;

    /// Close the connection without unlinking.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A freshly opened transport and its event stream.
pub struct TransportSession {
    pub handle: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens transports for agents.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Begin a handshake, resuming from `credentials` when present.
    async fn connect(
        &self,
        agent_id: &str,
        credentials: Option<CredentialMaterial>,
    ) -> Result<TransportSession, TransportError>;
}
