//! Health and administrative handlers.

use axum::{Json, body::Bytes, extract::State, http::StatusCode};
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::broker::LinkState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub hub_id: Uuid,
    pub subscribers: usize,
    pub broadcasts: u64,
    pub dropped: u64,
    pub broker: LinkState,
}

/// Health check with hub and broker status.
///
/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.hub.stats().await;
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        hub_id: stats.hub_id,
        subscribers: stats.subscribers,
        broadcasts: stats.broadcasts,
        dropped: stats.dropped,
        broker: state.source.link().state(),
    })
}

/// Submit a local event: broadcast to streams and publish to the broker.
///
/// POST /notify
#[instrument(skip(state, body), fields(len = body.len()))]
pub async fn notify(State(state): State<AppState>, body: Bytes) -> ApiResult<StatusCode> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::bad_request("event body must not be empty"));
    }
    state.source.notify(body).await;
    Ok(StatusCode::ACCEPTED)
}
