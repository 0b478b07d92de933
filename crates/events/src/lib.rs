//! Event protocol for the partner onboarding saga.
//!
//! This crate owns everything the participating services agree on:
//! the closed set of event kinds, the wire schemas, the JSON codec
//! (including the legacy fallback decode), the topic table, and the
//! bus abstraction with manual acknowledgement.

pub mod bus;
pub mod codec;
pub mod event;
pub mod in_memory_bus;
pub mod schema;
pub mod topics;

pub use bus::{
    BusSubscription, Delivery, MessageBus, MessageStream, PublishError, ReceiveError, Settle,
    SubscribeError,
};
pub use codec::CodecError;
pub use event::{EventKind, SagaEvent};
pub use in_memory_bus::InMemoryBus;
