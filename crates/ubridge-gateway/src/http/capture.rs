//! REST facade over the capture bus: the same operations as the WebSocket
//! transport, sharing one store and handler bus.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use ubridge_capture::CaptureError;
use ubridge_core::error::BridgeError;

use crate::app::AppState;
use crate::error::{parse_body, ApiError};

pub fn bridge_from_capture(err: CaptureError) -> BridgeError {
    match err {
        CaptureError::AlreadyExists(id) => BridgeError::invalid_argument(
            "sessionId",
            format!("capture session '{id}' already exists"),
        ),
        CaptureError::InvalidSessionId(id) => {
            BridgeError::invalid_argument("sessionId", format!("invalid session id '{id}'"))
        }
        CaptureError::NotFound(id) => BridgeError::SessionUnknown { id },
        CaptureError::Ended(id) => BridgeError::SessionEnded { id },
        CaptureError::Io(e) => BridgeError::Internal(e.to_string()),
        CaptureError::Serialization(e) => BridgeError::Internal(e.to_string()),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCaptureRequest {
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub session_id: String,
    pub events: Vec<serde_json::Value>,
}

/// POST /external/data/sessions/create
pub async fn create_session_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req: CreateCaptureRequest = parse_body(
        body,
        state.config.server.strict_body,
        &["sessionId", "title", "platform", "metadata"],
    )?;
    let session = state
        .capture
        .create_session(&req.session_id, req.title, req.platform, req.metadata)
        .await
        .map_err(bridge_from_capture)?;
    Ok(Json(serde_json::json!({ "session": session })))
}

/// POST /external/data/upload
pub async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req: UploadRequest = parse_body(
        body,
        state.config.server.strict_body,
        &["sessionId", "events"],
    )?;
    let accepted = state
        .capture
        .append_events(&req.session_id, req.events)
        .await
        .map_err(bridge_from_capture)?;
    Ok(Json(serde_json::json!({ "accepted": accepted })))
}

/// POST /external/data/sessions/{id}/end
pub async fn end_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .capture
        .end_session(&id)
        .await
        .map_err(bridge_from_capture)?;
    Ok(Json(serde_json::json!({ "session": session })))
}

/// GET /external/data/sessions/{id}
pub async fn get_session_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .capture
        .get(&id)
        .await
        .ok_or(BridgeError::SessionUnknown { id })?;
    Ok(Json(serde_json::json!({ "session": session })))
}
