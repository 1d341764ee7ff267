use crate::core::job::JobRecord;
use crate::core::store::{QueueError, Store};
use crate::core::{Attributes, Jid};

/// A dequeued job together with the queue it came from. Consuming methods end the current
/// delivery of the job.
pub struct JobHandle<'a, S: ?Sized> {
    store: &'a S,
    queue: &'a str,
    record: JobRecord,
}

impl<'a, S> JobHandle<'a, S>
where
    S: Store + ?Sized,
{
    pub fn new(store: &'a S, queue: &'a str, record: JobRecord) -> Self {
        Self {
            store,
            queue,
            record,
        }
    }

    pub fn id(&self) -> &Jid {
        &self.record.id
    }

    pub fn job_type(&self) -> &str {
        &self.record.job_type
    }

    pub fn attributes(&self) -> &Attributes {
        &self.record.attributes
    }

    /// How many times this job has failed already.
    pub fn errors(&self) -> u32 {
        self.record.errors
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    /// Job succeeded, remove it.
    pub async fn complete(self) -> Result<(), QueueError> {
        self.store.delete(self.queue, &self.record.id).await
    }

    /// Job failed and will be retried after `backoff_secs`. Records one more error.
    pub async fn fail(mut self, backoff_secs: u64) -> Result<(), QueueError> {
        self.record.errors = self.record.errors.saturating_add(1);
        let blob = self
            .record
            .to_blob()
            .map_err(|source| QueueError::EncodeError { source })?;
        self.store
            .backoff(self.queue, &self.record.id, &blob, backoff_secs)
            .await
    }

    /// Job failed for good. There is no dead queue, the job is gone afterwards.
    pub async fn discard(self) -> Result<(), QueueError> {
        self.store.delete(self.queue, &self.record.id).await
    }
}
