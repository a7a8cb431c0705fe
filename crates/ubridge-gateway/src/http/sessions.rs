use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use ubridge_core::error::BridgeError;
use ubridge_core::types::SessionConfig;

use crate::app::AppState;
use crate::audit::AuditInfo;
use crate::error::{parse_body, ApiError};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub device_id: String,
    pub config: SessionConfig,
}

/// POST /sessions
pub async fn create_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let req: CreateSessionRequest =
        parse_body(body, state.config.server.strict_body, &["deviceId", "config"])?;

    // Unknown provider ids fail shape-decoding above; a configured-but-absent
    // adapter is still a valid session target (it fails at chat time).
    let session = state
        .sessions
        .create(&state.devices, &req.device_id, req.config)?;

    let info = AuditInfo {
        device_id: Some(session.device_id.clone()),
        session_id: Some(session.id.clone()),
        provider: Some(session.config.provider),
        ..Default::default()
    };
    let mut response = Json(serde_json::json!({ "session": session })).into_response();
    response.extensions_mut().insert(info);
    Ok(response)
}

/// GET /sessions/{id}
pub async fn get_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .sessions
        .get(&id)
        .await
        .ok_or(BridgeError::SessionUnknown { id })?;
    Ok(Json(serde_json::json!({ "session": session })))
}

/// DELETE /sessions/{id}: transition to ended; idempotent.
pub async fn end_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state.sessions.end(&id).await?;
    let info = AuditInfo {
        session_id: Some(session.id.clone()),
        ..Default::default()
    };
    let mut response = Json(serde_json::json!({ "session": session })).into_response();
    response.extensions_mut().insert(info);
    Ok(response)
}
