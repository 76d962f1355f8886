use super::state::ApiState;
use crate::storage::StorageMode;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use std::sync::Arc;

#[derive(Serialize)]
pub(super) struct StatusResponse {
    status: &'static str,
    version: &'static str,
    model: String,
    ai_ready: bool,
    storage: StorageMode,
    retention: usize,
    uptime_seconds: u64,
}

/// Service status: model, storage mode and whether the model can be called.
pub(super) async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let relay = &state.relay;
    Json(StatusResponse {
        status: "running",
        version: env!("CARGO_PKG_VERSION"),
        model: relay.model().model_name().to_string(),
        ai_ready: relay.model().is_configured(),
        storage: relay.history().storage().mode().await,
        retention: relay.history().retention(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

pub(super) async fn health(state: State<Arc<ApiState>>) -> Json<StatusResponse> {
    status(state).await
}
