use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use ubridge_core::types::ProviderId;
use ubridge_providers::adapter::Health;

use crate::app::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReply {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub providers: HashMap<ProviderId, Health>,
}

/// GET /health: concurrent provider probes plus process uptime.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthReply> {
    let providers = state.registry.health_all().await;
    let status = if providers.values().any(|h| h.healthy) || providers.is_empty() {
        "ok"
    } else {
        "degraded"
    };
    Json(HealthReply {
        status,
        uptime_secs: state.uptime_secs(),
        providers,
    })
}
