//! In-memory store used by tests and single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::{
    Database, InsertOutcome, LifecycleStatus, LifecycleUpdate, MessageRecord, OwnerIdentity,
    SessionRecord,
};
use crate::error::DatabaseError;

/// Store backed by process memory.
#[derive(Default)]
pub struct MemoryDatabase {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    mirrors: RwLock<HashMap<String, String>>,
    messages: RwLock<Vec<MessageRecord>>,
    /// Artificial latency added to session record reads, in milliseconds.
    read_delay_ms: AtomicU64,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every session record read, simulating a slow store.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Insert or replace a whole session record.
    pub async fn put_session_record(&self, record: SessionRecord) {
        self.sessions
            .write()
            .await
            .insert(record.agent_id.clone(), record);
    }

    /// Number of message records held for an agent.
    pub async fn message_count(&self, agent_id: &str) -> usize {
        self.messages
            .read()
            .await
            .iter()
            .filter(|m| m.agent_id == agent_id)
            .count()
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn get_session_record(
        &self,
        agent_id: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(self.sessions.read().await.get(agent_id).cloned())
    }

    async fn update_lifecycle(
        &self,
        agent_id: &str,
        update: &LifecycleUpdate,
    ) -> Result<(), DatabaseError> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(agent_id.to_string())
            .or_insert_with(|| SessionRecord::new(agent_id, update.status))
            .apply(update);
        Ok(())
    }

    async fn claim_ownership(
        &self,
        agent_id: &str,
        owner: &OwnerIdentity,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions
            .entry(agent_id.to_string())
            .or_insert_with(|| SessionRecord::new(agent_id, LifecycleStatus::Connecting));
        record.owner = Some(owner.clone());
        record.last_heartbeat_at = Some(at);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn touch_heartbeat(
        &self,
        agent_id: &str,
        instance_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(agent_id) {
            Some(record)
                if record
                    .owner
                    .as_ref()
                    .is_some_and(|o| o.instance_id == instance_id) =>
            {
                record.last_heartbeat_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_ownership(&self, agent_id: &str) -> Result<(), DatabaseError> {
        if let Some(record) = self.sessions.write().await.get_mut(agent_id) {
            record.owner = None;
            record.last_heartbeat_at = None;
            record.active = false;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn save_credential_mirror(
        &self,
        agent_id: &str,
        payload: &str,
    ) -> Result<(), DatabaseError> {
        self.mirrors
            .write()
            .await
            .insert(agent_id.to_string(), payload.to_string());
        Ok(())
    }

    async fn load_credential_mirror(
        &self,
        agent_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        Ok(self.mirrors.read().await.get(agent_id).cloned())
    }

    async fn delete_credential_mirror(&self, agent_id: &str) -> Result<(), DatabaseError> {
        self.mirrors.write().await.remove(agent_id);
        Ok(())
    }

    async fn find_message_by_external_id(
        &self,
        agent_id: &str,
        external_id: &str,
    ) -> Result<Option<MessageRecord>, DatabaseError> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .find(|m| m.agent_id == agent_id && m.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn find_message_by_fallback_keys(
        &self,
        agent_id: &str,
        keys: &[String],
    ) -> Result<Option<MessageRecord>, DatabaseError> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .find(|m| m.agent_id == agent_id && keys.contains(&m.fallback_key))
            .cloned())
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<InsertOutcome, DatabaseError> {
        let mut messages = self.messages.write().await;
        if let Some(external_id) = &record.external_id {
            let exists = messages.iter().any(|m| {
                m.agent_id == record.agent_id && m.external_id.as_ref() == Some(external_id)
            });
            if exists {
                return Ok(InsertOutcome::Duplicate);
            }
        }
        messages.push(record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn mark_message_read(
        &self,
        agent_id: &str,
        external_id: &str,
    ) -> Result<bool, DatabaseError> {
        let mut messages = self.messages.write().await;
        match messages
            .iter_mut()
            .find(|m| m.agent_id == agent_id && m.external_id.as_deref() == Some(external_id))
        {
            Some(record) => {
                record.read = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_messages(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let messages = self.messages.read().await;
        let mut found: Vec<MessageRecord> = messages
            .iter()
            .filter(|m| m.agent_id == agent_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        found.truncate(limit);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Direction, MessageOrigin};
    use crate::ingest::MessageContent;

    fn record(external_id: Option<&str>) -> MessageRecord {
        MessageRecord {
            id: Uuid::new_v4(),
            agent_id: "A1".to_string(),
            external_id: external_id.map(String::from),
            fallback_key: "fk".to_string(),
            direction: Direction::Inbound,
            origin: MessageOrigin::ExternalNetwork,
            peer: "+15550001111".to_string(),
            sender: "+15550001111".to_string(),
            recipient: "+15551234567".to_string(),
            content: MessageContent::Text {
                body: "hi".to_string(),
            },
            sent_at: Utc::now(),
            read: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_unique_external_id() {
        let db = MemoryDatabase::new();
        assert_eq!(
            db.insert_message(&record(Some("M-1"))).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            db.insert_message(&record(Some("M-1"))).await.unwrap(),
            InsertOutcome::Duplicate
        );
        // Records without an external id are never rejected by the store.
        assert_eq!(
            db.insert_message(&record(None)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            db.insert_message(&record(None)).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(db.message_count("A1").await, 3);
    }

    #[tokio::test]
    async fn test_heartbeat_requires_ownership() {
        let db = MemoryDatabase::new();
        let owner = OwnerIdentity {
            instance_id: Uuid::new_v4(),
            host: "host-a".to_string(),
            pid: 10,
        };
        db.claim_ownership("A1", &owner, Utc::now()).await.unwrap();

        assert!(db
            .touch_heartbeat("A1", owner.instance_id, Utc::now())
            .await
            .unwrap());
        assert!(!db
            .touch_heartbeat("A1", Uuid::new_v4(), Utc::now())
            .await
            .unwrap());

        db.clear_ownership("A1").await.unwrap();
        let record = db.get_session_record("A1").await.unwrap().unwrap();
        assert!(record.owner.is_none());
        assert!(record.last_heartbeat_at.is_none());
    }

    #[tokio::test]
    async fn test_mark_read() {
        let db = MemoryDatabase::new();
        db.insert_message(&record(Some("M-9"))).await.unwrap();
        assert!(db.mark_message_read("A1", "M-9").await.unwrap());
        assert!(!db.mark_message_read("A1", "M-404").await.unwrap());
        let found = db.find_message_by_external_id("A1", "M-9").await.unwrap().unwrap();
        assert!(found.read);
    }
}
