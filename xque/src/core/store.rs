use async_trait::async_trait;
use thiserror::Error;

use crate::core::Jid;

/// Lowest accepted priority.
pub const MIN_PRIORITY: i8 = -4;
/// Highest accepted priority.
pub const MAX_PRIORITY: i8 = 4;
/// Ready ordering score multiplier for the priority, leaving the low bits to the sequence.
pub const PRIORITY_SHIFT: i64 = 1 << 50;

/// Ready ordering score for a job: higher priority first, then enqueue order.
pub fn priority_score(priority: i8, sequence: i64) -> i64 {
    -(priority as i64) * PRIORITY_SHIFT + sequence
}

/// The two per-queue orderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ordering {
    /// Jobs waiting to be picked up, by priority score.
    Ready,
    /// Jobs in flight or waiting for a retry, by visibility deadline.
    Pending,
}

/// A job taken out of the queue by [`Store::dequeue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawJob {
    pub jid: Jid,
    pub blob: String,
}

/// Atomic queue primitives on top of a shared store. Every method is a single atomic unit on the
/// store side and all deadline math uses the store's clock.
///
/// Per queue there is a ready ordering, a pending ordering and a sequence counter. The job table
/// is shared by all queues.
#[async_trait]
pub trait Store: Send + Sync {
    /// Write the blob into the job table and add the job to the ready ordering.
    async fn enqueue(
        &self,
        queue: &str,
        jid: &Jid,
        blob: &str,
        priority: i8,
    ) -> Result<(), QueueError>;

    /// Take the most overdue pending job, or else the head of the ready ordering, and (re)place it
    /// in the pending ordering with a deadline of `now + expiry`.
    async fn dequeue(&self, queue: &str) -> Result<Option<RawJob>, QueueError>;

    /// Replace the stored blob and push the pending deadline to `now + backoff_secs`.
    async fn backoff(
        &self,
        queue: &str,
        jid: &Jid,
        blob: &str,
        backoff_secs: u64,
    ) -> Result<(), QueueError>;

    /// Remove the job from the job table and the pending ordering. No-op if absent.
    async fn delete(&self, queue: &str, jid: &Jid) -> Result<(), QueueError>;

    /// Store time and the pending deadline of the job, read together.
    async fn pending_deadline(
        &self,
        queue: &str,
        jid: &Jid,
    ) -> Result<(Option<i64>, Option<i64>), QueueError>;

    async fn queue_size(&self, queue: &str) -> Result<u64, QueueError>;

    async fn pending_size(&self, queue: &str) -> Result<u64, QueueError>;

    /// Raw blob lookup.
    async fn find(&self, jid: &Jid) -> Result<Option<String>, QueueError>;

    /// Raw blob lookup for many jobs at once; positions match `jids`.
    async fn find_many(&self, jids: &[Jid]) -> Result<Vec<Option<String>>, QueueError>;

    /// Cursor based enumeration of an ordering. Start with cursor `0`; a returned cursor of `0`
    /// means the enumeration is complete. Ids may repeat across batches.
    async fn scan(
        &self,
        queue: &str,
        ordering: Ordering,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<Jid>), QueueError>;
}

#[async_trait]
impl<T> Store for std::sync::Arc<T>
where
    T: Store + ?Sized,
{
    async fn enqueue(
        &self,
        queue: &str,
        jid: &Jid,
        blob: &str,
        priority: i8,
    ) -> Result<(), QueueError> {
        (**self).enqueue(queue, jid, blob, priority).await
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<RawJob>, QueueError> {
        (**self).dequeue(queue).await
    }

    async fn backoff(
        &self,
        queue: &str,
        jid: &Jid,
        blob: &str,
        backoff_secs: u64,
    ) -> Result<(), QueueError> {
        (**self).backoff(queue, jid, blob, backoff_secs).await
    }

    async fn delete(&self, queue: &str, jid: &Jid) -> Result<(), QueueError> {
        (**self).delete(queue, jid).await
    }

    async fn pending_deadline(
        &self,
        queue: &str,
        jid: &Jid,
    ) -> Result<(Option<i64>, Option<i64>), QueueError> {
        (**self).pending_deadline(queue, jid).await
    }

    async fn queue_size(&self, queue: &str) -> Result<u64, QueueError> {
        (**self).queue_size(queue).await
    }

    async fn pending_size(&self, queue: &str) -> Result<u64, QueueError> {
        (**self).pending_size(queue).await
    }

    async fn find(&self, jid: &Jid) -> Result<Option<String>, QueueError> {
        (**self).find(jid).await
    }

    async fn find_many(&self, jids: &[Jid]) -> Result<Vec<Option<String>>, QueueError> {
        (**self).find_many(jids).await
    }

    async fn scan(
        &self,
        queue: &str,
        ordering: Ordering,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<Jid>), QueueError> {
        (**self).scan(queue, ordering, cursor, count).await
    }
}

/// Errors related to queue operation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QueueError {
    /// Encountered an error when tried to serialize a job.
    #[error("Failed to serialize job")]
    EncodeError {
        #[source]
        source: serde_json::Error,
    },
    /// Encountered an error when tried to deserialize a stored job.
    #[error("Failed to deserialize job")]
    DecodeError {
        #[source]
        source: serde_json::Error,
    },
    #[error("Priority must be within -4..=4: {0}")]
    InvalidPriority(i8),
    #[error("Job is missing declared attribute: {0}")]
    InvalidAttribute(String),
    #[error("Invalid options for job type {job_type}: {reason}")]
    InvalidOptions {
        job_type: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
