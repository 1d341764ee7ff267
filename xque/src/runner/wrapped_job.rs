use crate::core::job_processor::{JobError, JobProcessor};
use crate::core::{Attributes, Jid};
use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use tracing::instrument;

/// Shorthand for boxed trait object for a WrappedJob.
pub type BoxedJobHandler = Box<dyn JobProcessor<Payload = Attributes, Error = JobError>>;

/// Object-safe implementation of a job that can be used in runner. Generally speaking, you don't
/// need to directly use this type, JobRouter takes care of everything related to it.
pub struct WrappedJobHandler<T: JobProcessor> {
    job: T,
}

impl<J> WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
    J::Payload: DeserializeOwned,
    J::Error: Into<JobError>,
{
    pub fn new(job: J) -> Self {
        Self { job }
    }

    pub fn boxed(self) -> BoxedJobHandler {
        Box::new(self) as BoxedJobHandler
    }
}

#[async_trait]
impl<J> JobProcessor for WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
    J::Payload: DeserializeOwned,
    J::Error: Into<JobError>,
{
    type Payload = Attributes;
    type Error = JobError;

    #[instrument(skip_all, err, fields(jid = %jid, job_type = %Self::name()))]
    async fn handle(&self, jid: &Jid, payload: Self::Payload) -> Result<(), Self::Error> {
        let payload = serde_json::from_value(Value::Object(payload))?;
        // A panicking job is a failed job, not a dead consumer.
        match AssertUnwindSafe(self.job.handle(jid, payload))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(Into::into),
            Err(panic) => Err(JobError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    fn name() -> &'static str {
        J::name()
    }

    fn attributes() -> &'static [&'static str] {
        J::attributes()
    }

    fn options() -> crate::core::job::JobOptions {
        J::options()
    }
}

impl<J> From<J> for WrappedJobHandler<J>
where
    J: JobProcessor + 'static,
    J::Payload: DeserializeOwned,
    J::Error: Into<JobError>,
{
    fn from(job: J) -> Self {
        Self::new(job)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
