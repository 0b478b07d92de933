//! Bus adapters.
//!
//! The in-memory bus for tests/dev lives in `partnerflow-events`; the durable
//! Redis Streams adapter is here, behind the `redis` feature.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBus;
