//! Health endpoint: reports broker and store connectivity.

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use partnerflow_events::MessageBus;
use partnerflow_infra::SagaLogStore;

#[derive(Clone)]
pub struct AppState {
    pub bus: Arc<dyn MessageBus>,
    pub store: Arc<dyn SagaLogStore>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub bus_connected: bool,
    pub store_connected: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let bus_connected = state.bus.ping().await;
    let store_connected = state.store.ping().await;

    let (status, code) = if bus_connected && store_connected {
        ("ok", StatusCode::OK)
    } else {
        ("degraded", StatusCode::SERVICE_UNAVAILABLE)
    };

    (
        code,
        Json(HealthReport {
            status,
            bus_connected,
            store_connected,
        }),
    )
}
