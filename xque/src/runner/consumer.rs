use super::job_router::{JobRouter, RunnerError};
use crate::core::job::JobRecord;
use crate::core::job_handle::JobHandle;
use crate::core::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// How long an idle consumer waits before polling again.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// How long a consumer backs off after a store error.
pub const ERROR_SLEEP: Duration = Duration::from_secs(5);

/// Timing knobs of a consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub poll_interval: Duration,
    pub error_sleep: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            error_sleep: ERROR_SLEEP,
        }
    }
}

/// Takes jobs from one queue and runs them, one at a time, until stopped.
///
/// A dequeued job is invisible to other consumers until its expiry runs out. If the consumer
/// crashes or hangs, the job is redelivered to someone else once that happens.
pub struct Consumer<S> {
    store: S,
    queue_name: String,
    router: Arc<JobRouter>,
    config: ConsumerConfig,
    token: CancellationToken,
}

impl<S> Consumer<S>
where
    S: Store,
{
    pub fn new(store: S, queue_name: impl Into<String>, router: Arc<JobRouter>) -> Self {
        Self::with_config(store, queue_name, router, ConsumerConfig::default())
    }

    pub fn with_config(
        store: S,
        queue_name: impl Into<String>,
        router: Arc<JobRouter>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            store,
            queue_name: queue_name.into(),
            router,
            config,
            token: CancellationToken::new(),
        }
    }

    /// Stop together with `token`.
    pub(crate) fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Consume jobs until [`stop`](Self::stop) is called. A job that is running at that moment
    /// is finished first.
    #[instrument(skip_all, fields(queue = %self.queue_name))]
    pub async fn run(&self) {
        tracing::debug!("Consumer started");
        while !self.is_stopped() {
            self.run_once().await;
        }
        tracing::debug!("Consumer stopped");
    }

    /// Ask the consumer to stop. Wakes it up if it is waiting for work.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// One iteration of the loop: take a job and process it, or wait for work. Never fails;
    /// store errors are logged and followed by a pause.
    pub async fn run_once(&self) {
        if let Err(e) = self.try_run_once().await {
            self.handle_queue_error(e).await;
        }
    }

    async fn try_run_once(&self) -> Result<(), RunnerError> {
        let Some(raw) = self.store.dequeue(&self.queue_name).await? else {
            self.wait(self.config.poll_interval).await;
            return Ok(());
        };

        let record = match JobRecord::from_blob(&raw.blob) {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(
                    jid = %raw.jid,
                    blob = %raw.blob,
                    "Dropping job that can't be decoded: {}",
                    e
                );
                self.store.delete(&self.queue_name, &raw.jid).await?;
                return Ok(());
            }
        };

        let handle = JobHandle::new(&self.store, &self.queue_name, record);
        self.router.process(handle).await
    }

    /// Sleep for `duration` or until stopped, whichever comes first.
    async fn wait(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.token.cancelled() => {}
        }
    }

    async fn handle_queue_error(&self, error: RunnerError) {
        tracing::error!("Encountered QueueError: {}", error);
        tracing::warn!(
            "Suspending consumer for {} seconds",
            self.config.error_sleep.as_secs_f64()
        );
        self.wait(self.config.error_sleep).await;
    }
}
