use serde::{Deserialize, Serialize};
use std::fmt;

pub type DateTime = chrono::DateTime<chrono::Utc>;
pub use chrono::Utc;
pub use serde_json;

/// Ordered attribute map persisted with every job.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Queue used when none is given.
pub const DEFAULT_QUEUE_NAME: &str = "default";

pub mod job;
pub mod job_handle;
pub mod job_processor;
pub mod store;

/// Opaque job id. 128 random bits rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Jid(String);

impl Jid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Jid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Jid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for Jid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Generate a fresh job id.
pub fn new_jid() -> Jid {
    let bytes: [u8; 16] = rand::random();
    Jid(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}
