use crate::keys;
use anyhow::Context;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::sync::Arc;
use tracing::instrument;
use xque::core::store::{Ordering, QueueError, RawJob, Store};
use xque::core::Jid;

/// Expiry the dequeue script falls back to when a stored job doesn't carry one.
const FALLBACK_EXPIRY_SECS: u64 = 3_600;

struct Scripts {
    enqueue: Script,
    dequeue: Script,
    backoff: Script,
    delete: Script,
    pending_deadline: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(include_str!("scripts/enqueue.lua")),
            dequeue: Script::new(include_str!("scripts/dequeue.lua")),
            backoff: Script::new(include_str!("scripts/backoff.lua")),
            delete: Script::new(include_str!("scripts/delete.lua")),
            pending_deadline: Script::new(include_str!("scripts/pending_deadline.lua")),
        }
    }
}

/// An implementation of the Store backed by Redis. State changing operations run as Lua scripts
/// so they are atomic, and use the Redis clock for deadlines.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    scripts: Arc<Scripts>,
}

impl RedisStore {
    /// Connect to the Redis server at `url`, e.g. `redis://localhost:6379/0`. The connection
    /// reconnects on its own after failures.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = Client::open(url).context("Invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            scripts: Arc::new(Scripts::load()),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    #[instrument(skip_all, err, fields(queue = %queue, jid = %jid, priority = priority))]
    async fn enqueue(
        &self,
        queue: &str,
        jid: &Jid,
        blob: &str,
        priority: i8,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn();
        self.scripts
            .enqueue
            .key(keys::jobs())
            .key(keys::ready(queue))
            .key(keys::sequence(queue))
            .arg(jid.as_str())
            .arg(blob)
            .arg(priority)
            .invoke_async::<_, ()>(&mut conn)
            .await
            .context("Failed to add job to the queue")?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(queue = %queue))]
    async fn dequeue(&self, queue: &str) -> Result<Option<RawJob>, QueueError> {
        let mut conn = self.conn();
        let job: Option<(String, String)> = self
            .scripts
            .dequeue
            .key(keys::pending(queue))
            .key(keys::ready(queue))
            .key(keys::jobs())
            .arg(FALLBACK_EXPIRY_SECS)
            .invoke_async(&mut conn)
            .await
            .context("Failed to check out a job from the queue")?;
        Ok(job.map(|(jid, blob)| RawJob {
            jid: Jid::from(jid),
            blob,
        }))
    }

    #[instrument(skip_all, err, fields(queue = %queue, jid = %jid, backoff_secs = backoff_secs))]
    async fn backoff(
        &self,
        queue: &str,
        jid: &Jid,
        blob: &str,
        backoff_secs: u64,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn();
        self.scripts
            .backoff
            .key(keys::jobs())
            .key(keys::pending(queue))
            .arg(jid.as_str())
            .arg(blob)
            .arg(backoff_secs)
            .invoke_async::<_, ()>(&mut conn)
            .await
            .context("Failed to reschedule job")?;
        Ok(())
    }

    #[instrument(skip_all, err, fields(queue = %queue, jid = %jid))]
    async fn delete(&self, queue: &str, jid: &Jid) -> Result<(), QueueError> {
        let mut conn = self.conn();
        self.scripts
            .delete
            .key(keys::jobs())
            .key(keys::pending(queue))
            .arg(jid.as_str())
            .invoke_async::<_, ()>(&mut conn)
            .await
            .context("Failed to delete job")?;
        Ok(())
    }

    async fn pending_deadline(
        &self,
        queue: &str,
        jid: &Jid,
    ) -> Result<(Option<i64>, Option<i64>), QueueError> {
        let mut conn = self.conn();
        let reply: Vec<Option<String>> = self
            .scripts
            .pending_deadline
            .key(keys::pending(queue))
            .arg(jid.as_str())
            .invoke_async(&mut conn)
            .await
            .context("Failed to read pending deadline")?;
        let mut values = reply.into_iter().map(|v| v.as_deref().and_then(parse_seconds));
        let now = values.next().flatten();
        let deadline = values.next().flatten();
        Ok((now, deadline))
    }

    async fn queue_size(&self, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let size: u64 = conn
            .zcard(keys::ready(queue))
            .await
            .context("Failed to count queued jobs")?;
        Ok(size)
    }

    async fn pending_size(&self, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let size: u64 = conn
            .zcard(keys::pending(queue))
            .await
            .context("Failed to count pending jobs")?;
        Ok(size)
    }

    async fn find(&self, jid: &Jid) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn();
        let blob: Option<String> = conn
            .hget(keys::jobs(), jid.as_str())
            .await
            .context("Failed to look up job")?;
        Ok(blob)
    }

    async fn find_many(&self, jids: &[Jid]) -> Result<Vec<Option<String>>, QueueError> {
        if jids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let fields: Vec<&str> = jids.iter().map(Jid::as_str).collect();
        let blobs: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(keys::jobs())
            .arg(fields)
            .query_async(&mut conn)
            .await
            .context("Failed to look up jobs")?;
        Ok(blobs)
    }

    async fn scan(
        &self,
        queue: &str,
        ordering: Ordering,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<Jid>), QueueError> {
        let key = match ordering {
            Ordering::Ready => keys::ready(queue),
            Ordering::Pending => keys::pending(queue),
        };
        let mut conn = self.conn();
        let (cursor, members): (u64, Vec<String>) = redis::cmd("ZSCAN")
            .arg(key)
            .arg(cursor)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .context("Failed to scan queue")?;
        // Replies alternate between member and score.
        let jids = members.into_iter().step_by(2).map(Jid::from).collect();
        Ok((cursor, jids))
    }
}

/// Scores come back as strings and may be rendered as floats.
fn parse_seconds(value: &str) -> Option<i64> {
    value
        .parse::<i64>()
        .ok()
        .or_else(|| value.parse::<f64>().ok().map(|v| v.floor() as i64))
}
