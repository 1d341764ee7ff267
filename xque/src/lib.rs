#![doc = include_str!("../README.md")]

pub mod core;
pub mod memory;
pub mod producer;

/// Default implementation of the consumer side.
#[cfg(feature = "runner")]
pub mod runner {
    pub mod consumer;
    pub mod consumer_pool;
    pub mod job_router;
    pub mod wrapped_job;
}

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::core::{
        job::{JobOptions, JobRecord},
        job_handle::JobHandle,
        job_processor::{JobError, JobProcessor},
        store::{QueueError, RawJob, Store},
        Attributes, Jid, DEFAULT_QUEUE_NAME,
    };
    pub use super::producer::Producer;
    #[cfg(feature = "runner")]
    pub use super::runner::{
        consumer::{Consumer, ConsumerConfig},
        consumer_pool::ConsumerPool,
        job_router::{JobRouter, RegistrationError},
    };
}
