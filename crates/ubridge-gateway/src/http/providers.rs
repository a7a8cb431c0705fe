use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;

use ubridge_core::error::BridgeError;
use ubridge_core::types::ProviderId;

use crate::app::AppState;
use crate::error::{bridge_from_provider, ApiError};

/// GET /providers
pub async fn list_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "providers": state.registry.list() }))
}

/// GET /providers/{id}/models
pub async fn models_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let provider = ProviderId::parse(&id).ok_or_else(|| {
        BridgeError::invalid_argument("id", format!("unknown provider '{id}'"))
    })?;
    let adapter = state
        .registry
        .get(provider)
        .ok_or(BridgeError::ProviderUnavailable {
            provider,
            message: "provider not configured".to_string(),
        })?;

    let models = adapter
        .models()
        .await
        .map_err(|e| bridge_from_provider(provider, e))?;
    Ok(Json(serde_json::json!({ "provider": provider, "models": models })))
}
