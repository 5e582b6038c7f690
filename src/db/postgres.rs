//! PostgreSQL store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::{
    Database, InsertOutcome, LifecycleUpdate, MessageRecord, OwnerIdentity, SessionRecord,
};
use crate::error::{DatabaseError, FailureInfo};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Store backed by a PostgreSQL connection pool.
pub struct PgDatabase {
    pool: Pool,
}

impl PgDatabase {
    /// Create a new store and connect to the database.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Apply embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.pool.get().await?;
        let report = embedded::migrations::runner()
            .run_async(&mut **conn)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        tracing::info!(
            applied = report.applied_migrations().len(),
            "Database migrations complete"
        );
        Ok(())
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }
}

fn session_from_row(row: &Row) -> Result<SessionRecord, DatabaseError> {
    let status: String = row.get("status");
    let status = status.parse().map_err(DatabaseError::Serialization)?;

    let owner = match row.get::<_, Option<Uuid>>("owner_instance_id") {
        Some(instance_id) => Some(OwnerIdentity {
            instance_id,
            host: row
                .get::<_, Option<String>>("owner_host")
                .unwrap_or_default(),
            pid: row.get::<_, Option<i32>>("owner_pid").unwrap_or_default() as u32,
        }),
        None => None,
    };

    let failure = match row.get::<_, Option<String>>("failure_kind") {
        Some(kind) => Some(FailureInfo {
            kind: kind.parse().map_err(DatabaseError::Serialization)?,
            reason: row
                .get::<_, Option<String>>("failure_reason")
                .unwrap_or_default(),
            at: row
                .get::<_, Option<DateTime<Utc>>>("failure_at")
                .unwrap_or_else(Utc::now),
        }),
        None => None,
    };

    Ok(SessionRecord {
        agent_id: row.get("agent_id"),
        status,
        active: row.get("active"),
        identity: row.get("identity"),
        pairing_code: row.get("pairing_code"),
        pairing_code_issued_at: row.get("pairing_code_issued_at"),
        owner,
        last_heartbeat_at: row.get("last_heartbeat_at"),
        failure,
        connected_at: row.get("connected_at"),
        updated_at: row.get("updated_at"),
    })
}

fn message_from_row(row: &Row) -> Result<MessageRecord, DatabaseError> {
    let direction: String = row.get("direction");
    let origin: String = row.get("origin");
    let content: serde_json::Value = row.get("content");

    Ok(MessageRecord {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        external_id: row.get("external_id"),
        fallback_key: row.get("fallback_key"),
        direction: direction.parse().map_err(DatabaseError::Serialization)?,
        origin: origin.parse().map_err(DatabaseError::Serialization)?,
        peer: row.get("peer"),
        sender: row.get("sender"),
        recipient: row.get("recipient"),
        content: serde_json::from_value(content)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        sent_at: row.get("sent_at"),
        read: row.get("is_read"),
        created_at: row.get("created_at"),
    })
}

const MESSAGE_COLUMNS: &str = "id, agent_id, external_id, fallback_key, direction, origin, peer, \
     sender, recipient, content, sent_at, is_read, created_at";

#[async_trait]
impl Database for PgDatabase {
    async fn get_session_record(
        &self,
        agent_id: &str,
    ) -> Result<Option<SessionRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT * FROM agent_sessions WHERE agent_id = $1",
                &[&agent_id],
            )
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn update_lifecycle(
        &self,
        agent_id: &str,
        update: &LifecycleUpdate,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let (code, issued_at) = match &update.pairing_code {
            Some((code, at)) => (Some(code.as_str()), Some(*at)),
            None => (None, None),
        };
        let failure_kind = update.failure.as_ref().map(|f| f.kind.to_string());
        let failure_reason = update.failure.as_ref().map(|f| f.reason.as_str());
        let failure_at = update.failure.as_ref().map(|f| f.at);

        conn.execute(
            r#"
            INSERT INTO agent_sessions (
                agent_id, status, active, identity, pairing_code, pairing_code_issued_at,
                failure_kind, failure_reason, failure_at, connected_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW())
            ON CONFLICT (agent_id) DO UPDATE SET
                status = EXCLUDED.status,
                active = EXCLUDED.active,
                identity = COALESCE(EXCLUDED.identity, agent_sessions.identity),
                pairing_code = EXCLUDED.pairing_code,
                pairing_code_issued_at = EXCLUDED.pairing_code_issued_at,
                failure_kind = EXCLUDED.failure_kind,
                failure_reason = EXCLUDED.failure_reason,
                failure_at = EXCLUDED.failure_at,
                connected_at = COALESCE(EXCLUDED.connected_at, agent_sessions.connected_at),
                updated_at = NOW()
            "#,
            &[
                &agent_id,
                &update.status.as_str(),
                &update.active,
                &update.identity,
                &code,
                &issued_at,
                &failure_kind,
                &failure_reason,
                &failure_at,
                &update.connected_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn claim_ownership(
        &self,
        agent_id: &str,
        owner: &OwnerIdentity,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO agent_sessions (
                agent_id, status, owner_instance_id, owner_host, owner_pid, last_heartbeat_at
            ) VALUES ($1, 'connecting', $2, $3, $4, $5)
            ON CONFLICT (agent_id) DO UPDATE SET
                owner_instance_id = EXCLUDED.owner_instance_id,
                owner_host = EXCLUDED.owner_host,
                owner_pid = EXCLUDED.owner_pid,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                updated_at = NOW()
            "#,
            &[
                &agent_id,
                &owner.instance_id,
                &owner.host,
                &(owner.pid as i32),
                &at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn touch_heartbeat(
        &self,
        agent_id: &str,
        instance_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE agent_sessions SET last_heartbeat_at = $3 \
                 WHERE agent_id = $1 AND owner_instance_id = $2",
                &[&agent_id, &instance_id, &at],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn clear_ownership(&self, agent_id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            UPDATE agent_sessions SET
                owner_instance_id = NULL,
                owner_host = NULL,
                owner_pid = NULL,
                last_heartbeat_at = NULL,
                active = FALSE,
                updated_at = NOW()
            WHERE agent_id = $1
            "#,
            &[&agent_id],
        )
        .await?;
        Ok(())
    }

    async fn save_credential_mirror(
        &self,
        agent_id: &str,
        payload: &str,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO agent_credentials (agent_id, payload, updated_at) VALUES ($1, $2, NOW()) \
             ON CONFLICT (agent_id) DO UPDATE SET payload = EXCLUDED.payload, updated_at = NOW()",
            &[&agent_id, &payload],
        )
        .await?;
        Ok(())
    }

    async fn load_credential_mirror(
        &self,
        agent_id: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT payload FROM agent_credentials WHERE agent_id = $1",
                &[&agent_id],
            )
            .await?;
        Ok(row.map(|r| r.get("payload")))
    }

    async fn delete_credential_mirror(&self, agent_id: &str) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            "DELETE FROM agent_credentials WHERE agent_id = $1",
            &[&agent_id],
        )
        .await?;
        Ok(())
    }

    async fn find_message_by_external_id(
        &self,
        agent_id: &str,
        external_id: &str,
    ) -> Result<Option<MessageRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!(
            "SELECT {} FROM agent_messages WHERE agent_id = $1 AND external_id = $2",
            MESSAGE_COLUMNS
        );
        let row = conn.query_opt(&query, &[&agent_id, &external_id]).await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn find_message_by_fallback_keys(
        &self,
        agent_id: &str,
        keys: &[String],
    ) -> Result<Option<MessageRecord>, DatabaseError> {
        if keys.is_empty() {
            return Ok(None);
        }
        let conn = self.conn().await?;
        let query = format!(
            "SELECT {} FROM agent_messages WHERE agent_id = $1 AND fallback_key = ANY($2) \
             ORDER BY created_at ASC LIMIT 1",
            MESSAGE_COLUMNS
        );
        let row = conn.query_opt(&query, &[&agent_id, &keys]).await?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<InsertOutcome, DatabaseError> {
        let conn = self.conn().await?;
        let content = serde_json::to_value(&record.content)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        let inserted = conn
            .execute(
                r#"
                INSERT INTO agent_messages (
                    id, agent_id, external_id, fallback_key, direction, origin, peer,
                    sender, recipient, content, sent_at, is_read, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (agent_id, external_id) WHERE external_id IS NOT NULL DO NOTHING
                "#,
                &[
                    &record.id,
                    &record.agent_id,
                    &record.external_id,
                    &record.fallback_key,
                    &record.direction.as_str(),
                    &record.origin.as_str(),
                    &record.peer,
                    &record.sender,
                    &record.recipient,
                    &content,
                    &record.sent_at,
                    &record.read,
                    &record.created_at,
                ],
            )
            .await?;

        Ok(if inserted == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn mark_message_read(
        &self,
        agent_id: &str,
        external_id: &str,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE agent_messages SET is_read = TRUE WHERE agent_id = $1 AND external_id = $2",
                &[&agent_id, &external_id],
            )
            .await?;
        Ok(updated > 0)
    }

    async fn list_messages(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let conn = self.conn().await?;
        let query = format!(
            "SELECT {} FROM agent_messages WHERE agent_id = $1 ORDER BY sent_at DESC LIMIT $2",
            MESSAGE_COLUMNS
        );
        let rows = conn.query(&query, &[&agent_id, &(limit as i64)]).await?;
        rows.iter().map(message_from_row).collect()
    }
}
