use crate::core::job::{extract_attributes, JobRecord};
use crate::core::job_processor::JobProcessor;
use crate::core::store::{Ordering, QueueError, Store, MAX_PRIORITY, MIN_PRIORITY};
use crate::core::{new_jid, Jid, DEFAULT_QUEUE_NAME};
use chrono::SubsecRound;
use futures::stream::{self, Stream};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::instrument;

/// How many ids `scan_each` looks up per round-trip.
pub const SCAN_BATCH_SIZE: usize = 100;

/// Pushes jobs into a queue and answers questions about its state.
///
/// ## Example
/// ```rust
/// # use xque::prelude::*;
/// # use xque::memory::MemoryStore;
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Serialize, Deserialize)]
/// # struct Resize { path: String }
/// # struct ResizeImage;
/// # #[async_trait::async_trait]
/// # impl JobProcessor for ResizeImage {
/// #     type Payload = Resize;
/// #     type Error = std::convert::Infallible;
/// #     fn name() -> &'static str { "resize_image" }
/// #     fn attributes() -> &'static [&'static str] { &["path"] }
/// #     async fn handle(&self, _jid: &Jid, _payload: Resize) -> Result<(), Self::Error> { Ok(()) }
/// # }
/// # tokio_test(async {
/// let producer = Producer::with_queue(MemoryStore::new(), "images");
/// let jid = producer
///     .enqueue::<ResizeImage>(&Resize { path: "cat.png".into() }, 0)
///     .await?;
/// assert_eq!(producer.size().await?, 1);
/// assert!(producer.find(&jid).await?.is_some());
/// # Ok::<(), QueueError>(())
/// # }).unwrap();
/// # fn tokio_test<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Producer<S> {
    store: S,
    queue_name: String,
}

impl<S: Store> Producer<S> {
    /// Producer for the default queue.
    pub fn new(store: S) -> Self {
        Self::with_queue(store, DEFAULT_QUEUE_NAME)
    }

    pub fn with_queue(store: S, queue_name: impl Into<String>) -> Self {
        Self {
            store,
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Enqueue a job. Jobs with higher priority (-4..=4) get dequeued first, jobs of equal
    /// priority in the order they were enqueued.
    #[instrument(skip_all, err, fields(queue = %self.queue_name, job_type = J::name(), priority = priority, jid))]
    pub async fn enqueue<J>(&self, payload: &J::Payload, priority: i8) -> Result<Jid, QueueError>
    where
        J: JobProcessor + 'static,
        J::Payload: Serialize,
    {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(QueueError::InvalidPriority(priority));
        }
        let options = J::options();
        options
            .validate()
            .map_err(|reason| QueueError::InvalidOptions {
                job_type: J::name(),
                reason,
            })?;

        let value =
            serde_json::to_value(payload).map_err(|source| QueueError::EncodeError { source })?;
        let attributes = extract_attributes(J::attributes(), value)?;

        let jid = new_jid();
        tracing::Span::current().record("jid", &tracing::field::display(&jid));

        let record = JobRecord {
            id: jid.clone(),
            job_type: J::name().to_string(),
            attributes,
            expiry: options.expiry,
            created_at: chrono::Utc::now().trunc_subsecs(0),
            errors: 0,
        };
        let blob = record
            .to_blob()
            .map_err(|source| QueueError::EncodeError { source })?;

        self.store
            .enqueue(&self.queue_name, &jid, &blob, priority)
            .await?;
        tracing::debug!("Enqueued job {}", jid);
        Ok(jid)
    }

    /// Number of queued and pending jobs.
    pub async fn size(&self) -> Result<u64, QueueError> {
        Ok(self.queue_size().await? + self.pending_size().await?)
    }

    /// Number of jobs waiting to be picked up for the first time.
    pub async fn queue_size(&self) -> Result<u64, QueueError> {
        self.store.queue_size(&self.queue_name).await
    }

    /// Number of jobs being worked on or waiting for a retry.
    pub async fn pending_size(&self) -> Result<u64, QueueError> {
        self.store.pending_size(&self.queue_name).await
    }

    /// Look up a job by id. Does not tell whether it is queued or pending.
    pub async fn find(&self, jid: &Jid) -> Result<Option<JobRecord>, QueueError> {
        self.store
            .find(jid)
            .await?
            .map(|blob| JobRecord::from_blob(&blob))
            .transpose()
            .map_err(|source| QueueError::DecodeError { source })
    }

    /// Iterate over all pending, then all queued jobs of the queue. Jobs that disappear while
    /// iterating are skipped; this is not a snapshot. Jobs that can't be decoded are logged and
    /// skipped, consumers drop them once they come up.
    pub fn scan_each(&self) -> impl Stream<Item = Result<JobRecord, QueueError>> + '_ {
        stream::try_unfold(ScanState::default(), move |mut state| async move {
            loop {
                if let Some(record) = state.buffered.pop_front() {
                    return Ok::<_, QueueError>(Some((record, state)));
                }
                let Some(ordering) = state.ordering() else {
                    return Ok::<_, QueueError>(None);
                };

                let (cursor, jids) = self
                    .store
                    .scan(&self.queue_name, ordering, state.cursor, SCAN_BATCH_SIZE)
                    .await?;
                if cursor == 0 {
                    state.next_ordering();
                } else {
                    state.cursor = cursor;
                }
                if jids.is_empty() {
                    continue;
                }

                let blobs = self.store.find_many(&jids).await?;
                for (jid, blob) in jids.iter().zip(blobs) {
                    let Some(blob) = blob else { continue };
                    match JobRecord::from_blob(&blob) {
                        Ok(record) => state.buffered.push_back(record),
                        Err(e) => {
                            tracing::error!(
                                jid = %jid,
                                blob = %blob,
                                "Skipping job that can't be decoded: {}",
                                e
                            );
                        }
                    }
                }
            }
        })
    }

    /// Seconds until a pending job becomes visible again. `None` if the job is unknown or not
    /// pending.
    pub async fn pending_time(&self, jid: &Jid) -> Result<Option<i64>, QueueError> {
        match self.store.pending_deadline(&self.queue_name, jid).await? {
            (Some(now), Some(deadline)) => Ok(Some(deadline - now)),
            _ => Ok(None),
        }
    }
}

const SCAN_ORDER: [Ordering; 2] = [Ordering::Pending, Ordering::Ready];

#[derive(Default)]
struct ScanState {
    position: usize,
    cursor: u64,
    buffered: VecDeque<JobRecord>,
}

impl ScanState {
    fn ordering(&self) -> Option<Ordering> {
        SCAN_ORDER.get(self.position).copied()
    }

    fn next_ordering(&mut self) {
        self.position += 1;
        self.cursor = 0;
    }
}
