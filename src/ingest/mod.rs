//! Message ingestion and dedup pipeline.
//!
//! For every raw message from a connected session:
//!
//! 1. learn linked-device address mappings, then filter non-addressable
//!    targets and protocol-only payloads;
//! 2. classify the payload into a [`MessageContent`] variant;
//! 3. resolve peer, sender and recipient addresses;
//! 4. compute the primary (external id) and fallback dedup keys;
//! 5. skip if either key, or a pending local-send echo, matches;
//! 6. persist once (a store-level uniqueness hit is a successful dedup);
//! 7. forward newly created, forward-eligible records to the webhook.
//!
//! Forwarding failures are logged and never roll back the record.

mod address;
mod classify;
mod dedup;

pub use address::{AddressResolver, canonical_phone};
pub use classify::{MessageContent, ReplyKind, SkipReason, classify, is_addressable};
pub use dedup::{EchoTracker, FallbackKeys, direction_tag, normalize_content};

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::DedupConfig;
use crate::db::{Database, Direction, InsertOutcome, MessageOrigin, MessageRecord};
use crate::error::DatabaseError;
use crate::transport::{OutgoingContent, RawMessage, SendReceipt};
use crate::webhook::{WebhookDispatcher, WebhookPayload};

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Skipped(SkipReason),
    Duplicate,
    Persisted { record_id: Uuid, forwarded: bool },
}

/// Per-agent ingestion pipeline.
pub struct IngestPipeline {
    agent_id: String,
    db: Arc<dyn Database>,
    webhook: Arc<dyn WebhookDispatcher>,
    config: DedupConfig,
    forward_outbound: bool,
    resolver: AddressResolver,
    echoes: EchoTracker,
}

impl IngestPipeline {
    pub fn new(
        agent_id: impl Into<String>,
        db: Arc<dyn Database>,
        webhook: Arc<dyn WebhookDispatcher>,
        config: DedupConfig,
        forward_outbound: bool,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            db,
            webhook,
            echoes: EchoTracker::new(config.clone()),
            config,
            forward_outbound,
            resolver: AddressResolver::new(),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Run one raw event through the pipeline. `own_identity` is the agent's
    /// canonical address, when known.
    pub async fn ingest(
        &self,
        raw: &RawMessage,
        own_identity: Option<&str>,
    ) -> Result<IngestOutcome, DatabaseError> {
        self.resolver.learn(raw).await;

        let content = match classify(raw) {
            Ok(content) => content,
            Err(reason) => {
                tracing::trace!(agent_id = %self.agent_id, remote = %raw.remote, ?reason, "Skipping message");
                return Ok(IngestOutcome::Skipped(reason));
            }
        };

        let peer = self.resolver.resolve(&raw.remote).await;
        let own = own_identity.unwrap_or_default().to_string();
        let (direction, sender, recipient) = if raw.from_me {
            (Direction::Outbound, own.clone(), peer.clone())
        } else {
            let sender = match raw.participant.as_deref() {
                Some(participant) => self.resolver.resolve(participant).await,
                None => peer.clone(),
            };
            (Direction::Inbound, sender, own.clone())
        };

        if let Some(external_id) = raw.id.as_deref() {
            if self
                .db
                .find_message_by_external_id(&self.agent_id, external_id)
                .await?
                .is_some()
            {
                tracing::debug!(agent_id = %self.agent_id, external_id, "Duplicate external id");
                return Ok(IngestOutcome::Duplicate);
            }
        }

        let tag = direction_tag(direction, &peer, own_identity);
        let text = content.dedup_text();
        let keys = FallbackKeys::compute(tag, &peer, &text, raw.timestamp, &self.config);

        if raw.from_me && self.echoes.take_match(&peer, &text, raw.timestamp).await {
            tracing::debug!(agent_id = %self.agent_id, peer = %peer, "Suppressed echo of local send");
            return Ok(IngestOutcome::Duplicate);
        }

        if let Some(existing) = self
            .db
            .find_message_by_fallback_keys(&self.agent_id, &keys.lookup_keys())
            .await?
        {
            let distinct = self.config.keep_distinct_ids
                && existing.origin == MessageOrigin::ExternalNetwork
                && existing.external_id.is_some()
                && raw.id.is_some()
                && existing.external_id.as_deref() != raw.id.as_deref();
            if !distinct {
                tracing::debug!(
                    agent_id = %self.agent_id,
                    existing = %existing.id,
                    "Duplicate by fallback key"
                );
                return Ok(IngestOutcome::Duplicate);
            }
        }

        let record = MessageRecord {
            id: Uuid::new_v4(),
            agent_id: self.agent_id.clone(),
            external_id: raw.id.clone(),
            fallback_key: keys.current,
            direction,
            origin: MessageOrigin::ExternalNetwork,
            peer,
            sender,
            recipient,
            content,
            sent_at: raw.timestamp,
            read: false,
            created_at: Utc::now(),
        };
        self.persist_and_forward(record).await
    }

    /// Persist a message sent through the control surface and remember it so
    /// its network echo is suppressed.
    pub async fn record_local_send(
        &self,
        own_identity: Option<&str>,
        target: &str,
        content: &OutgoingContent,
        receipt: &SendReceipt,
    ) -> Result<IngestOutcome, DatabaseError> {
        let peer = self.resolver.resolve(target).await;
        let content = match content {
            OutgoingContent::Text { body } => MessageContent::Text { body: body.clone() },
            OutgoingContent::Media { kind, caption, .. } => MessageContent::Media {
                kind: *kind,
                caption: caption.clone(),
                mime_type: None,
            },
        };
        let text = content.dedup_text();
        let tag = direction_tag(Direction::Outbound, &peer, own_identity);
        let keys = FallbackKeys::compute(tag, &peer, &text, receipt.timestamp, &self.config);

        self.echoes.note(&peer, &text, receipt.timestamp).await;

        let record = MessageRecord {
            id: Uuid::new_v4(),
            agent_id: self.agent_id.clone(),
            external_id: Some(receipt.message_id.clone()),
            fallback_key: keys.current,
            direction: Direction::Outbound,
            origin: MessageOrigin::LocalControl,
            sender: own_identity.unwrap_or_default().to_string(),
            recipient: peer.clone(),
            peer,
            content,
            sent_at: receipt.timestamp,
            read: true,
            created_at: Utc::now(),
        };
        self.persist_and_forward(record).await
    }

    async fn persist_and_forward(&self, record: MessageRecord) -> Result<IngestOutcome, DatabaseError> {
        match self.db.insert_message(&record).await? {
            InsertOutcome::Duplicate => {
                tracing::debug!(
                    agent_id = %self.agent_id,
                    external_id = ?record.external_id,
                    "Store rejected duplicate message"
                );
                return Ok(IngestOutcome::Duplicate);
            }
            InsertOutcome::Inserted => {}
        }

        let eligible = record.content.is_forward_eligible()
            && (record.direction == Direction::Inbound || self.forward_outbound);
        let mut forwarded = false;
        if eligible {
            let payload = WebhookPayload::from_record(&record);
            match self.webhook.dispatch(&payload).await {
                Ok(()) => forwarded = true,
                Err(e) => {
                    tracing::warn!(
                        agent_id = %self.agent_id,
                        message_id = %payload.message_id,
                        "Webhook forwarding failed, record kept: {}",
                        e
                    );
                }
            }
        }

        tracing::info!(
            agent_id = %self.agent_id,
            direction = record.direction.as_str(),
            origin = record.origin.as_str(),
            variant = record.content.variant(),
            forwarded,
            "Message persisted"
        );
        Ok(IngestOutcome::Persisted {
            record_id: record.id,
            forwarded,
        })
    }
}
