//! Relational queue store on Postgres.
//!
//! Two tables, both indexed by `connection_id`. The reserve step runs as a
//! single `UPDATE … FROM (SELECT … FOR UPDATE SKIP LOCKED)` statement, so
//! concurrent takes for the same connection serialize at the row level and
//! never hand the same pending message to two callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use postgres_types::ToSql;
use tokio_postgres::NoTls;
use uuid::Uuid;

use crate::config::PostgresConfig;
use crate::error::StorageError;
use crate::store::{LiveSessionRecord, MessageState, PickupStore, QueuedMessage};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queued_messages (
    id UUID PRIMARY KEY,
    connection_id TEXT NOT NULL,
    recipient_dids TEXT[] NOT NULL,
    encrypted_message JSONB NOT NULL,
    state TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS queued_messages_connection_idx
    ON queued_messages (connection_id);

CREATE TABLE IF NOT EXISTS live_sessions (
    session_id TEXT NOT NULL,
    connection_id TEXT NOT NULL,
    instance TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS live_sessions_connection_idx
    ON live_sessions (connection_id);
";

const RESERVE_SQL: &str = "
WITH picked AS (
    SELECT id FROM queued_messages
    WHERE (connection_id = $1 OR ($2::TEXT IS NOT NULL AND $2 = ANY(recipient_dids)))
      AND state = 'pending'
    ORDER BY created_at, id
    LIMIT $3
    FOR UPDATE SKIP LOCKED
)
UPDATE queued_messages m
SET state = 'sending'
FROM picked p
WHERE m.id = p.id
RETURNING m.id, m.connection_id, m.recipient_dids, m.encrypted_message, m.state, m.created_at
";

const TAKE_DELETE_SQL: &str = "
WITH picked AS (
    SELECT id FROM queued_messages
    WHERE (connection_id = $1 OR ($2::TEXT IS NOT NULL AND $2 = ANY(recipient_dids)))
      AND state = 'pending'
    ORDER BY created_at, id
    LIMIT $3
    FOR UPDATE SKIP LOCKED
)
DELETE FROM queued_messages m
USING picked p
WHERE m.id = p.id
RETURNING m.id, m.connection_id, m.recipient_dids, m.encrypted_message, m.state, m.created_at
";

/// Postgres-backed queue store.
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Create the store and its connection pool.
    pub fn new(config: &PostgresConfig) -> Result<Self, StorageError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url.clone());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::CreatePool {
                reason: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, StorageError> {
        Ok(self.pool.get().await?)
    }
}

fn row_to_message(row: &tokio_postgres::Row) -> Result<QueuedMessage, StorageError> {
    let state: String = row.get("state");
    Ok(QueuedMessage {
        id: row.get("id"),
        connection_id: row.get("connection_id"),
        recipient_dids: row.get("recipient_dids"),
        encrypted_message: row.get("encrypted_message"),
        state: state.parse()?,
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl PickupStore for PostgresStore {
    async fn initialize(&self) -> Result<(), StorageError> {
        let conn = self.conn().await?;
        conn.batch_execute(SCHEMA).await?;
        tracing::info!("postgres store ready");
        Ok(())
    }

    async fn add_message(
        &self,
        connection_id: &str,
        recipient_dids: &[String],
        payload: &serde_json::Value,
        has_local_session: bool,
    ) -> Result<(Uuid, DateTime<Utc>), StorageError> {
        let conn = self.conn().await?;
        let id = Uuid::new_v4();
        let state = if has_local_session {
            MessageState::Sending
        } else {
            MessageState::Pending
        };

        let row = conn
            .query_one(
                "INSERT INTO queued_messages (id, connection_id, recipient_dids, encrypted_message, state)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING created_at",
                &[&id, &connection_id, &recipient_dids, &payload, &state.as_str()],
            )
            .await?;

        Ok((id, row.get("created_at")))
    }

    async fn take_messages(
        &self,
        connection_id: &str,
        limit: Option<usize>,
        delete: bool,
        recipient_did: Option<&str>,
    ) -> Result<Vec<QueuedMessage>, StorageError> {
        let conn = self.conn().await?;
        // LIMIT NULL means unbounded.
        let limit: Option<i64> = limit.map(|n| n as i64);
        let params: [&(dyn ToSql + Sync); 3] = [&connection_id, &recipient_did, &limit];

        let sql = if delete { TAKE_DELETE_SQL } else { RESERVE_SQL };
        let rows = conn.query(sql, &params).await?;

        // UPDATE … RETURNING has no ordering guarantee; restore FIFO here.
        let mut messages = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>, _>>()?;
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn pending_count(
        &self,
        connection_id: &str,
        recipient_did: Option<&str>,
    ) -> Result<usize, StorageError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) FROM queued_messages
                 WHERE (connection_id = $1 OR ($2::TEXT IS NOT NULL AND $2 = ANY(recipient_dids)))
                   AND state = 'pending'",
                &[&connection_id, &recipient_did],
            )
            .await?;
        let count: i64 = row.get(0);
        Ok(count as usize)
    }

    async fn remove_messages(
        &self,
        connection_id: &str,
        message_ids: &[Uuid],
    ) -> Result<(), StorageError> {
        let conn = self.conn().await?;
        conn.execute(
            "DELETE FROM queued_messages WHERE connection_id = $1 AND id = ANY($2)",
            &[&connection_id, &message_ids],
        )
        .await?;
        Ok(())
    }

    async fn requeue_in_flight(&self, connection_id: &str) -> Result<u64, StorageError> {
        let conn = self.conn().await?;
        let moved = conn
            .execute(
                "UPDATE queued_messages SET state = 'pending'
                 WHERE connection_id = $1 AND state = 'sending'",
                &[&connection_id],
            )
            .await?;
        if moved > 0 {
            tracing::debug!("requeued {} in-flight message(s) for {}", moved, connection_id);
        }
        Ok(moved)
    }

    async fn find_live_session(
        &self,
        connection_id: &str,
    ) -> Result<Option<LiveSessionRecord>, StorageError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT session_id, connection_id, instance, created_at
                 FROM live_sessions
                 WHERE connection_id = $1
                 ORDER BY created_at DESC
                 LIMIT 1",
                &[&connection_id],
            )
            .await?;

        Ok(row.map(|row| LiveSessionRecord {
            session_id: row.get("session_id"),
            connection_id: row.get("connection_id"),
            instance: row.get("instance"),
            created_at: row.get("created_at"),
        }))
    }

    async fn save_live_session(
        &self,
        session_id: &str,
        connection_id: &str,
        instance: &str,
    ) -> Result<(), StorageError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO live_sessions (session_id, connection_id, instance) VALUES ($1, $2, $3)",
            &[&session_id, &connection_id, &instance],
        )
        .await?;
        Ok(())
    }

    async fn remove_live_session(&self, connection_id: &str) -> Result<(), StorageError> {
        let conn = self.conn().await?;
        conn.execute(
            "DELETE FROM live_sessions WHERE connection_id = $1",
            &[&connection_id],
        )
        .await?;
        Ok(())
    }

    async fn clear_instance_sessions(&self, instance: &str) -> Result<u64, StorageError> {
        let conn = self.conn().await?;
        let cleared = conn
            .execute("DELETE FROM live_sessions WHERE instance = $1", &[&instance])
            .await?;
        if cleared > 0 {
            tracing::info!("cleared {} stale live session(s) for instance {}", cleared, instance);
        }
        Ok(cleared)
    }
}
