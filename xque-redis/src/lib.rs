#![doc = include_str!("../README.md")]

pub mod keys;
pub mod store;

pub use store::RedisStore;

/// Environment variable holding the Redis URL used by tests and the bench.
pub const REDIS_URL_ENV: &str = "XQUE_REDIS_URL";
