//! Document queue store on Redis.
//!
//! Layout mirrors the collection-per-entity shape of a document store:
//! one hash per message (`waystation:message:{id}`), a per-connection
//! sorted set as the `connection_id` index, and a per-recipient-DID sorted
//! set for key-based queries. Both indexes score by enqueue time, which is
//! the FIFO key. The find-then-update paths run as Lua scripts: Redis
//! executes a script atomically, which is what keeps concurrent takes from
//! reserving the same message twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use uuid::Uuid;

use crate::config::RedisConfig;
use crate::error::StorageError;
use crate::store::{LiveSessionRecord, MessageState, PickupStore, QueuedMessage};

const MESSAGE_PREFIX: &str = "waystation:message:";
const QUEUE_PREFIX: &str = "waystation:queue:";
const DID_PREFIX: &str = "waystation:did:";
const LIVE_PREFIX: &str = "waystation:live:";

/// KEYS[1] = connection queue zset, KEYS[2] = DID index zset (same as
/// KEYS[1] when the query has no recipient DID). Returns matched messages
/// as a flat array, six entries per message.
const TAKE_SCRIPT: &str = r#"
local queue_prefix = ARGV[1]
local msg_prefix = ARGV[2]
local did_prefix = ARGV[3]
local limit = tonumber(ARGV[4])
local delete = ARGV[5] == '1'

local ids = {}
local seen = {}
local function collect(key)
    local entries = redis.call('ZRANGE', key, 0, -1, 'WITHSCORES')
    for i = 1, #entries, 2 do
        local id = entries[i]
        if not seen[id] then
            seen[id] = true
            ids[#ids + 1] = { id = id, score = tonumber(entries[i + 1]) }
        end
    end
end
collect(KEYS[1])
if KEYS[2] ~= KEYS[1] then collect(KEYS[2]) end
table.sort(ids, function(a, b)
    if a.score == b.score then return a.id < b.id end
    return a.score < b.score
end)

local out = {}
local taken = 0
for _, entry in ipairs(ids) do
    if limit >= 0 and taken >= limit then break end
    local key = msg_prefix .. entry.id
    local fields = redis.call('HMGET', key,
        'state', 'connection_id', 'recipient_dids', 'encrypted_message', 'created_at')
    if fields[1] == 'pending' then
        local state = 'sending'
        if delete then
            redis.call('DEL', key)
            redis.call('ZREM', queue_prefix .. fields[2], entry.id)
            for _, did in ipairs(cjson.decode(fields[3])) do
                redis.call('ZREM', did_prefix .. did, entry.id)
            end
        else
            redis.call('HSET', key, 'state', state)
        end
        taken = taken + 1
        out[#out + 1] = entry.id
        out[#out + 1] = fields[2]
        out[#out + 1] = fields[3]
        out[#out + 1] = fields[4]
        out[#out + 1] = fields[5]
        out[#out + 1] = state
    end
end
return out
"#;

/// KEYS[1] = connection queue zset, KEYS[2] = DID index zset (same as
/// KEYS[1] when the query has no recipient DID).
const COUNT_SCRIPT: &str = r#"
local n = 0
local seen = {}
local function count(key)
    for _, id in ipairs(redis.call('ZRANGE', key, 0, -1)) do
        if not seen[id] then
            seen[id] = true
            if redis.call('HGET', ARGV[1] .. id, 'state') == 'pending' then
                n = n + 1
            end
        end
    end
end
count(KEYS[1])
if KEYS[2] ~= KEYS[1] then count(KEYS[2]) end
return n
"#;

const REQUEUE_SCRIPT: &str = r#"
local n = 0
for _, id in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
    local key = ARGV[1] .. id
    if redis.call('HGET', key, 'state') == 'sending' then
        redis.call('HSET', key, 'state', 'pending')
        n = n + 1
    end
end
return n
"#;

/// KEYS[1] = connection queue zset; ARGV = msg prefix, did prefix,
/// connection id, then the message ids. Unknown ids and ids owned by a
/// different connection are skipped, which makes removal idempotent.
const REMOVE_SCRIPT: &str = r#"
for i = 4, #ARGV do
    local id = ARGV[i]
    local key = ARGV[1] .. id
    local fields = redis.call('HMGET', key, 'connection_id', 'recipient_dids')
    if fields[1] == ARGV[3] then
        redis.call('DEL', key)
        redis.call('ZREM', KEYS[1], id)
        for _, did in ipairs(cjson.decode(fields[2])) do
            redis.call('ZREM', ARGV[2] .. did, id)
        end
    end
end
return redis.status_reply('OK')
"#;

/// Redis-backed queue store.
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    /// Open a connection to Redis.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StorageError> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

fn queue_key(connection_id: &str) -> String {
    format!("{}{}", QUEUE_PREFIX, connection_id)
}

fn did_key(did: &str) -> String {
    format!("{}{}", DID_PREFIX, did)
}

fn live_key(connection_id: &str) -> String {
    format!("{}{}", LIVE_PREFIX, connection_id)
}

fn parse_created_at(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Backend {
            reason: format!("bad created_at '{}': {}", raw, e),
        })
}

fn parse_message_id(raw: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw).map_err(|e| StorageError::Backend {
        reason: format!("bad message id '{}': {}", raw, e),
    })
}

#[async_trait]
impl PickupStore for RedisStore {
    async fn initialize(&self) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::info!("redis store ready");
        Ok(())
    }

    async fn add_message(
        &self,
        connection_id: &str,
        recipient_dids: &[String],
        payload: &serde_json::Value,
        has_local_session: bool,
    ) -> Result<(Uuid, DateTime<Utc>), StorageError> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        let id_str = id.to_string();
        let score = created_at.timestamp_millis() as f64;
        let state = if has_local_session {
            MessageState::Sending
        } else {
            MessageState::Pending
        };

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset_multiple(
            format!("{}{}", MESSAGE_PREFIX, id_str),
            &[
                ("connection_id", connection_id.to_string()),
                ("recipient_dids", serde_json::to_string(recipient_dids)?),
                ("encrypted_message", serde_json::to_string(payload)?),
                ("state", state.as_str().to_string()),
                ("created_at", created_at.to_rfc3339()),
            ],
        )
        .ignore();
        pipe.zadd(queue_key(connection_id), &id_str, score).ignore();
        for did in recipient_dids {
            pipe.zadd(did_key(did), &id_str, score).ignore();
        }

        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok((id, created_at))
    }

    async fn take_messages(
        &self,
        connection_id: &str,
        limit: Option<usize>,
        delete: bool,
        recipient_did: Option<&str>,
    ) -> Result<Vec<QueuedMessage>, StorageError> {
        let queue = queue_key(connection_id);
        let did_index = recipient_did.map(did_key).unwrap_or_else(|| queue.clone());
        let limit: i64 = limit.map(|n| n as i64).unwrap_or(-1);

        let mut conn = self.conn();
        let rows: Vec<String> = redis::Script::new(TAKE_SCRIPT)
            .key(&queue)
            .key(&did_index)
            .arg(QUEUE_PREFIX)
            .arg(MESSAGE_PREFIX)
            .arg(DID_PREFIX)
            .arg(limit)
            .arg(if delete { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        let mut messages = Vec::with_capacity(rows.len() / 6);
        for chunk in rows.chunks_exact(6) {
            messages.push(QueuedMessage {
                id: parse_message_id(&chunk[0])?,
                connection_id: chunk[1].clone(),
                recipient_dids: serde_json::from_str(&chunk[2])?,
                encrypted_message: serde_json::from_str(&chunk[3])?,
                created_at: parse_created_at(&chunk[4])?,
                state: chunk[5].parse()?,
            });
        }
        Ok(messages)
    }

    async fn pending_count(
        &self,
        connection_id: &str,
        recipient_did: Option<&str>,
    ) -> Result<usize, StorageError> {
        let queue = queue_key(connection_id);
        let did_index = recipient_did.map(did_key).unwrap_or_else(|| queue.clone());

        let mut conn = self.conn();
        let count: i64 = redis::Script::new(COUNT_SCRIPT)
            .key(&queue)
            .key(&did_index)
            .arg(MESSAGE_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        Ok(count as usize)
    }

    async fn remove_messages(
        &self,
        connection_id: &str,
        message_ids: &[Uuid],
    ) -> Result<(), StorageError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let script = redis::Script::new(REMOVE_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(queue_key(connection_id))
            .arg(MESSAGE_PREFIX)
            .arg(DID_PREFIX)
            .arg(connection_id);
        for id in message_ids {
            invocation.arg(id.to_string());
        }

        let mut conn = self.conn();
        let _: () = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn requeue_in_flight(&self, connection_id: &str) -> Result<u64, StorageError> {
        let mut conn = self.conn();
        let moved: i64 = redis::Script::new(REQUEUE_SCRIPT)
            .key(queue_key(connection_id))
            .arg(MESSAGE_PREFIX)
            .invoke_async(&mut conn)
            .await?;
        if moved > 0 {
            tracing::debug!("requeued {} in-flight message(s) for {}", moved, connection_id);
        }
        Ok(moved as u64)
    }

    async fn find_live_session(
        &self,
        connection_id: &str,
    ) -> Result<Option<LiveSessionRecord>, StorageError> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(live_key(connection_id)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StorageError::from))
            .transpose()
    }

    async fn save_live_session(
        &self,
        session_id: &str,
        connection_id: &str,
        instance: &str,
    ) -> Result<(), StorageError> {
        let record = LiveSessionRecord {
            session_id: session_id.to_string(),
            connection_id: connection_id.to_string(),
            instance: instance.to_string(),
            created_at: Utc::now(),
        };

        let mut conn = self.conn();
        // SET overwrites: the most recent session wins.
        let _: () = conn
            .set(live_key(connection_id), serde_json::to_string(&record)?)
            .await?;
        Ok(())
    }

    async fn remove_live_session(&self, connection_id: &str) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let _: () = conn.del(live_key(connection_id)).await?;
        Ok(())
    }

    async fn clear_instance_sessions(&self, instance: &str) -> Result<u64, StorageError> {
        let mut scan_conn = self.conn();
        let keys: Vec<String> = {
            let mut iter = scan_conn
                .scan_match::<_, String>(format!("{}*", LIVE_PREFIX))
                .await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        let mut conn = self.conn();
        let mut cleared = 0;
        for key in keys {
            let raw: Option<String> = conn.get(&key).await?;
            let Some(json) = raw else { continue };
            let record: LiveSessionRecord = serde_json::from_str(&json)?;
            if record.instance == instance {
                let _: () = conn.del(&key).await?;
                cleared += 1;
            }
        }
        if cleared > 0 {
            tracing::info!("cleared {} stale live session(s) for instance {}", cleared, instance);
        }
        Ok(cleared)
    }
}
