//! Operational surface: the health endpoint.

pub mod health;

pub use health::{AppState, router};
