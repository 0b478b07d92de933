//! Infrastructure layer: saga log storage, bus adapters, the coordinator,
//! and background workers.

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod saga_log;
pub mod workers;


pub use config::Config;
pub use coordinator::SagaCoordinator;
pub use saga_log::{
    EntryStatus, InMemorySagaLogStore, NewLogEntry, PostgresSagaLogStore, SagaLogEntry,
    SagaLogError, SagaLogStore, SagaRecord,
};
pub use workers::Reprocessor;
