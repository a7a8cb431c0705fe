use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use ubridge_sessions::{Capabilities, Device, DeviceType};

use crate::app::AppState;
use crate::audit::AuditInfo;
use crate::error::{parse_body, ApiError};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(default)]
    pub capabilities: Capabilities,
}

/// POST /devices/register
pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let req: RegisterRequest = parse_body(
        body,
        state.config.server.strict_body,
        &["name", "type", "capabilities"],
    )?;
    let device = state
        .devices
        .register(req.name, req.device_type, req.capabilities);
    let device_id = device.id.clone();

    let mut response = Json(serde_json::json!({ "device": device })).into_response();
    response.extensions_mut().insert(AuditInfo {
        device_id: Some(device_id),
        ..Default::default()
    });
    Ok(response)
}

/// GET /devices
pub async fn list_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let devices: Vec<Device> = state.devices.list();
    Json(serde_json::json!({ "devices": devices }))
}
