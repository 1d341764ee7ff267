use crate::core::job::JobOptions;
use crate::core::Jid;
use async_trait::async_trait;
use std::convert::Infallible;
use thiserror::Error;

/// A job-handler interface. Your Payload should implement `serde::{Serialize, Deserialize}` if
/// you're planning to enqueue it with a `Producer` and run it with a `Consumer`.
///
/// ## Example
/// ```rust
/// use xque::prelude::{JobProcessor, JobOptions, Jid};
/// use async_trait::async_trait;
/// use serde::{Deserialize, Serialize};
/// struct SendMail;
///
/// impl SendMail {
///     async fn do_work(&self, _to: &str) -> anyhow::Result<()> {
///         // ..do some work
///         Ok(())
///     }
/// }
///
/// #[derive(Serialize, Deserialize)]
/// struct SendMailPayload {
///     to: String,
///     subject: String,
/// }
///
/// #[async_trait::async_trait]
/// impl JobProcessor for SendMail {
///     type Payload = SendMailPayload;
///     type Error = anyhow::Error;
///
///     fn name() -> &'static str {
///         "send_mail"
///     }
///
///     fn attributes() -> &'static [&'static str] {
///         &["to", "subject"]
///     }
///
///     fn options() -> JobOptions {
///         JobOptions::default().with_expiry(1_800).with_retries(5)
///     }
///
///     async fn handle(&self, _jid: &Jid, payload: Self::Payload) -> Result<(), Self::Error> {
///         self.do_work(&payload.to).await
///     }
/// }
/// ```
/// ## Services
/// If your job processor requires external services (i.e. database client, REST client, etc.), add
/// them directly as your struct fields.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// What is the input to this handler. Declared attributes are read from its serialized form.
    type Payload: Send;
    /// What error is returned
    type Error: Send;
    /// Run the job, passing payload to it.
    async fn handle(&self, jid: &Jid, payload: Self::Payload) -> Result<(), Self::Error>;

    /// Job type, used to find the processor for a stored job.
    fn name() -> &'static str
    where
        Self: Sized;

    /// Payload fields persisted with the job, in order.
    fn attributes() -> &'static [&'static str]
    where
        Self: Sized,
    {
        &[]
    }

    /// Expiry, retries and backoff schedule for this job type.
    fn options() -> JobOptions
    where
        Self: Sized,
    {
        JobOptions::default()
    }
}

/// Error types returned by job processor that wraps your job processor.
#[derive(Error, Debug)]
pub enum JobError {
    /// Encountered an error when tried to build the payload from stored attributes.
    #[error("Failed to deserialize job attributes")]
    DecodeError {
        #[from]
        source: serde_json::Error,
    },

    #[error("No processor registered for job type: {0}")]
    UnknownJobType(String),

    #[error("Job panicked: {0}")]
    Panicked(String),

    /// Error originated in inner-job implementation
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<Infallible> for JobError {
    fn from(_: Infallible) -> Self {
        unreachable!();
    }
}
