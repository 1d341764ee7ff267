use crate::core::store::QueueError;
use crate::core::{Attributes, DateTime, Jid};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;

/// Backoff used when a job type declares an empty backoff schedule.
pub const DEFAULT_BACKOFF_SECS: u64 = 60;

/// A job as it is persisted in the job table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Jid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub attributes: Attributes,
    /// Visibility timeout in seconds.
    pub expiry: u64,
    pub created_at: DateTime,
    /// How many times execution has failed so far.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub errors: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl JobRecord {
    pub fn from_blob(blob: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(blob)
    }

    pub fn to_blob(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Per job type options.
///
/// ```rust
/// use xque::prelude::JobOptions;
///
/// let options = JobOptions::default()
///     .with_expiry(1_800)
///     .with_retries(5)
///     .with_backoff([50, 100, 200]);
/// assert_eq!(options.backoff_for(4), 200);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOptions {
    /// Seconds a dequeued job stays invisible before it gets redelivered.
    pub expiry: u64,
    /// How many failures are retried before the job is dropped.
    pub retries: u32,
    /// Seconds to wait before the n-th retry, indexed by failure count.
    pub backoff: Cow<'static, [u64]>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            expiry: 3_600,
            retries: 2,
            backoff: Cow::Borrowed(&[30, 90, 270]),
        }
    }
}

impl JobOptions {
    pub fn with_expiry(mut self, expiry: u64) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: impl Into<Vec<u64>>) -> Self {
        self.backoff = Cow::Owned(backoff.into());
        self
    }

    /// Seconds to wait after the `errors`-th failure. Past the end of the schedule the last entry
    /// is reused.
    pub fn backoff_for(&self, errors: u32) -> u64 {
        let index = errors.saturating_sub(1) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(DEFAULT_BACKOFF_SECS)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.expiry == 0 {
            return Err("expiry must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Pick the declared attributes out of a serialized job payload, in declaration order.
pub(crate) fn extract_attributes(
    declared: &[&str],
    payload: Value,
) -> Result<Attributes, QueueError> {
    let mut fields = match payload {
        Value::Object(fields) => fields,
        _ if declared.is_empty() => return Ok(Attributes::new()),
        _ => return Err(QueueError::InvalidAttribute(declared[0].to_string())),
    };

    let mut attributes = Attributes::new();
    for name in declared {
        let value = fields
            .remove(*name)
            .ok_or_else(|| QueueError::InvalidAttribute(name.to_string()))?;
        attributes.insert(name.to_string(), value);
    }
    Ok(attributes)
}
