use super::wrapped_job::{BoxedJobHandler, WrappedJobHandler};
use crate::core::job::JobOptions;
use crate::core::job_handle::JobHandle;
use crate::core::job_processor::{JobError, JobProcessor};
use crate::core::store::{QueueError, Store};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use thiserror::Error;
use tracing::instrument;

/// A job processor router. Matches job type to job processor implementation.
/// This type requires that your job payloads implement `serde::Deserialize`.
///
/// ## Example
/// ```rust
/// use xque::prelude::{JobProcessor, JobRouter, Jid};
/// use async_trait::async_trait;
/// use serde::{Deserialize, Serialize};
/// struct MyJob;
/// #[derive(Serialize, Deserialize)]
/// struct MyJobPayload {
///     user_id: u64,
/// }
///
/// #[async_trait::async_trait]
/// impl JobProcessor for MyJob {
///     type Payload = MyJobPayload;
///     type Error = anyhow::Error;
///
///     fn name() -> &'static str {
///         "my_job"
///     }
///
///     fn attributes() -> &'static [&'static str] {
///         &["user_id"]
///     }
///
///     async fn handle(&self, jid: &Jid, payload: Self::Payload) -> Result<(), Self::Error> {
///         // ..do work
///         Ok(())
///     }
/// }
///
/// let router = {
///     let mut r = JobRouter::default();
///     r.add_job_handler(MyJob).unwrap();
///     r
/// };
/// assert_eq!(router.types(), vec!["my_job"]);
///```
#[derive(Default)]
pub struct JobRouter {
    jobs: HashMap<&'static str, Route>,
}

struct Route {
    handler: BoxedJobHandler,
    options: JobOptions,
}

impl JobRouter {
    /// Register a job handler with the router. Job types must be unique and their options valid.
    pub fn add_job_handler<J>(&mut self, job: J) -> Result<(), RegistrationError>
    where
        J: JobProcessor + 'static,
        J::Payload: DeserializeOwned,
        J::Error: Into<JobError>,
    {
        let name = J::name();
        if self.jobs.contains_key(name) {
            return Err(RegistrationError::DuplicateJobType(name));
        }
        let options = J::options();
        options
            .validate()
            .map_err(|reason| RegistrationError::InvalidOptions {
                job_type: name,
                reason,
            })?;

        let handler = WrappedJobHandler::new(job).boxed();
        self.jobs.insert(name, Route { handler, options });
        Ok(())
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.jobs.keys().copied().collect()
    }

    /// Process job handle. This function is responsible for the job lifecycle: a job that
    /// succeeds is deleted, a job that fails is scheduled for a retry according to its backoff
    /// schedule, and a job that has used up its retries is dropped. Unknown job types count as
    /// failures.
    #[instrument(skip_all, err, fields(job_type = %job_handle.job_type(), jid = %job_handle.id(), errors = job_handle.errors()))]
    pub async fn process<S>(&self, job_handle: JobHandle<'_, S>) -> Result<(), RunnerError>
    where
        S: Store + ?Sized,
    {
        let route = self.jobs.get(job_handle.job_type());
        let result = match route {
            Some(r) => {
                r.handler
                    .handle(job_handle.id(), job_handle.attributes().clone())
                    .await
            }
            None => Err(JobError::UnknownJobType(job_handle.job_type().to_string())),
        };

        match result {
            Ok(_) => {
                job_handle.complete().await?;
                Ok(())
            }
            Err(e) => {
                tracing::error!("Error during job processing: {}", e);
                let options = route.map(|r| r.options.clone()).unwrap_or_default();
                let errors = job_handle.errors().saturating_add(1);
                if errors > options.retries {
                    tracing::warn!(
                        "Dropping job {} after {} failed attempts",
                        job_handle.id(),
                        errors
                    );
                    job_handle.discard().await?;
                } else {
                    let backoff = options.backoff_for(errors);
                    tracing::debug!("Retrying job {} in {}s", job_handle.id(), backoff);
                    job_handle.fail(backoff).await?;
                }
                Ok(())
            }
        }
    }
}

/// Errors returned when registering a job handler.
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Job type is already registered: {0}")]
    DuplicateJobType(&'static str),
    #[error("Invalid options for job type {job_type}: {reason}")]
    InvalidOptions {
        job_type: &'static str,
        reason: String,
    },
}

/// Errors returned by the router.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    QueueError(#[from] QueueError),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::job::JobRecord;
    use crate::core::{Attributes, Jid};
    use crate::memory::MemoryStore;
    use crate::producer::Producer;
    use serde::{Deserialize, Serialize};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const QUEUE: &str = "default";

    #[derive(Serialize, Deserialize)]
    struct Count {
        by: usize,
    }

    #[derive(Serialize, Deserialize)]
    struct Nothing {}

    struct Counter(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl JobProcessor for Counter {
        type Payload = Count;
        type Error = Infallible;

        async fn handle(&self, _jid: &Jid, payload: Count) -> Result<(), Infallible> {
            self.0.fetch_add(payload.by, Ordering::SeqCst);
            Ok(())
        }

        fn name() -> &'static str {
            "counter"
        }

        fn attributes() -> &'static [&'static str] {
            &["by"]
        }
    }

    struct Flaky;

    #[async_trait::async_trait]
    impl JobProcessor for Flaky {
        type Payload = Nothing;
        type Error = anyhow::Error;

        async fn handle(&self, _jid: &Jid, _payload: Nothing) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("boom"))
        }

        fn name() -> &'static str {
            "flaky"
        }

        fn options() -> JobOptions {
            JobOptions::default().with_retries(1).with_backoff([60])
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl JobProcessor for Broken {
        type Payload = Nothing;
        type Error = Infallible;

        async fn handle(&self, _jid: &Jid, _payload: Nothing) -> Result<(), Infallible> {
            panic!("we did it patrick");
        }

        fn name() -> &'static str {
            "broken"
        }

        fn options() -> JobOptions {
            JobOptions::default().with_retries(0)
        }
    }

    struct Stubborn;

    #[async_trait::async_trait]
    impl JobProcessor for Stubborn {
        type Payload = Nothing;
        type Error = anyhow::Error;

        async fn handle(&self, _jid: &Jid, _payload: Nothing) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("again"))
        }

        fn name() -> &'static str {
            "stubborn"
        }

        fn options() -> JobOptions {
            JobOptions::default().with_retries(u32::MAX).with_backoff([0])
        }
    }

    struct NoExpiry;

    #[async_trait::async_trait]
    impl JobProcessor for NoExpiry {
        type Payload = Nothing;
        type Error = Infallible;

        async fn handle(&self, _jid: &Jid, _payload: Nothing) -> Result<(), Infallible> {
            Ok(())
        }

        fn name() -> &'static str {
            "no_expiry"
        }

        fn options() -> JobOptions {
            JobOptions::default().with_expiry(0)
        }
    }

    async fn next_handle(store: &MemoryStore) -> JobHandle<'_, MemoryStore> {
        let raw = store.dequeue(QUEUE).await.unwrap().unwrap();
        JobHandle::new(store, QUEUE, JobRecord::from_blob(&raw.blob).unwrap())
    }

    #[tokio::test]
    async fn it_is_object_safe_and_wrappable() {
        let count = Arc::new(AtomicUsize::new(0));
        let wrapped: Box<dyn JobProcessor<Payload = Attributes, Error = JobError>> =
            Box::new(WrappedJobHandler::new(Counter(count.clone())));

        let mut attributes = Attributes::new();
        attributes.insert("by".to_string(), 3.into());
        wrapped.handle(&Jid::from("a"), attributes).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);

        let result = wrapped.handle(&Jid::from("b"), Attributes::new()).await;
        assert!(matches!(result, Err(JobError::DecodeError { .. })));
    }

    #[test]
    fn registration_is_validated() {
        let mut router = JobRouter::default();
        router
            .add_job_handler(Counter(Arc::new(AtomicUsize::new(0))))
            .unwrap();
        let result = router.add_job_handler(Counter(Arc::new(AtomicUsize::new(0))));
        assert!(matches!(
            result,
            Err(RegistrationError::DuplicateJobType("counter"))
        ));

        let result = router.add_job_handler(NoExpiry);
        assert!(matches!(
            result,
            Err(RegistrationError::InvalidOptions { .. })
        ));
        assert_eq!(router.types(), vec!["counter"]);
    }

    #[tokio::test]
    async fn successful_job_is_deleted() {
        let store = MemoryStore::new();
        let producer = Producer::new(store.clone());
        let count = Arc::new(AtomicUsize::new(0));
        let mut router = JobRouter::default();
        router.add_job_handler(Counter(count.clone())).unwrap();

        let jid = producer.enqueue::<Counter>(&Count { by: 2 }, 0).await.unwrap();
        router.process(next_handle(&store).await).await.unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(producer.find(&jid).await.unwrap().is_none());
        assert_eq!(producer.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_job_backs_off_then_is_dropped() {
        let store = MemoryStore::new();
        let producer = Producer::new(store.clone());
        let mut router = JobRouter::default();
        router.add_job_handler(Flaky).unwrap();

        let jid = producer.enqueue::<Flaky>(&Nothing {}, 0).await.unwrap();

        router.process(next_handle(&store).await).await.unwrap();
        let record = producer.find(&jid).await.unwrap().unwrap();
        assert_eq!(record.errors, 1);
        let pending_time = producer.pending_time(&jid).await.unwrap().unwrap();
        assert!((59..=60).contains(&pending_time));
        assert!(store.dequeue(QUEUE).await.unwrap().is_none());

        store.advance(61);
        router.process(next_handle(&store).await).await.unwrap();
        assert!(producer.find(&jid).await.unwrap().is_none());
        assert_eq!(producer.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_job_type_uses_default_policy() {
        let store = MemoryStore::new();
        let producer = Producer::new(store.clone());
        let router = JobRouter::default();
        let jid = producer.enqueue::<Flaky>(&Nothing {}, 0).await.unwrap();
        let defaults = JobOptions::default();

        for attempt in 1..=defaults.retries {
            router.process(next_handle(&store).await).await.unwrap();
            let record = producer.find(&jid).await.unwrap().unwrap();
            assert_eq!(record.errors, attempt);
            let pending_time = producer.pending_time(&jid).await.unwrap().unwrap();
            assert!(pending_time <= defaults.backoff_for(attempt) as i64);
            store.advance(defaults.backoff_for(attempt) as i64 + 1);
        }

        router.process(next_handle(&store).await).await.unwrap();
        assert!(producer.find(&jid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn error_count_saturates() {
        let store = MemoryStore::new();
        let producer = Producer::new(store.clone());
        let mut router = JobRouter::default();
        router.add_job_handler(Stubborn).unwrap();

        let jid = producer.enqueue::<Stubborn>(&Nothing {}, 0).await.unwrap();
        let raw = store.dequeue(QUEUE).await.unwrap().unwrap();
        let mut record = JobRecord::from_blob(&raw.blob).unwrap();
        record.errors = u32::MAX;
        router
            .process(JobHandle::new(&store, QUEUE, record))
            .await
            .unwrap();

        let record = producer.find(&jid).await.unwrap().unwrap();
        assert_eq!(record.errors, u32::MAX);
        assert!(producer.pending_time(&jid).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn panicking_job_counts_as_failure() {
        let store = MemoryStore::new();
        let producer = Producer::new(store.clone());
        let mut router = JobRouter::default();
        router.add_job_handler(Broken).unwrap();

        let jid = producer.enqueue::<Broken>(&Nothing {}, 0).await.unwrap();
        router.process(next_handle(&store).await).await.unwrap();
        assert!(producer.find(&jid).await.unwrap().is_none());
    }
}
