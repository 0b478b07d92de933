//! Saga domain module (partner onboarding state machine).
//!
//! The state machine is a total function over `(state, event tag)`; the
//! aggregate wraps it with duplicate suppression and deterministic replay.
//! No IO lives here; running sagas is infrastructure's job.

pub mod machine;
pub mod state;

pub use machine::{Fingerprint, Observation, Saga, fingerprint};
pub use state::{SagaState, SideEffect, TransitionOutcome, step};
