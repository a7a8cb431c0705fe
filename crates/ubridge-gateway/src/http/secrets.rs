use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use ubridge_core::error::BridgeError;
use ubridge_core::types::ProviderId;

use crate::app::AppState;
use crate::error::{parse_body, ApiError};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetAndValidateRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub value: String,
    pub provider: String,
}

/// POST /secrets/set-and-validate: probe the provider, persist only on
/// success, and hot-reload the matching adapter credential.
pub async fn set_and_validate_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let req: SetAndValidateRequest = parse_body(
        body,
        state.config.server.strict_body,
        &["name", "value", "provider"],
    )?;
    if req.value.is_empty() {
        return Err(ApiError(BridgeError::invalid_argument(
            "value",
            "secret value must not be empty",
        )));
    }

    let name = req
        .name
        .unwrap_or_else(|| default_secret_name(&req.provider));
    let validation = state
        .vault
        .set_and_validate(&state.http, &name, &req.value, &req.provider)
        .await
        .map_err(|e| BridgeError::Internal(e.to_string()))?;

    // A vault change for a provider's key reloads that adapter in place.
    if validation.valid {
        if let Some(provider) = provider_for(&req.provider) {
            state.registry.reload_key(provider, &req.value);
            info!(provider = %provider, "provider key updated from vault");
        }
    }

    Ok(Json(serde_json::json!({
        "name": name,
        "valid": validation.valid,
        "error": validation.error,
    })))
}

/// GET /secrets/list: metadata only, never plaintext.
pub async fn list_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "secrets": state.vault.list() }))
}

/// DELETE /secrets/{name}
pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state
        .vault
        .delete(&name)
        .map_err(|e| BridgeError::Internal(e.to_string()))?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

fn default_secret_name(provider: &str) -> String {
    match provider {
        "anthropic" | "claude" => "ANTHROPIC_API_KEY".to_string(),
        "openai" => "OPENAI_API_KEY".to_string(),
        "google" | "gemini" => "GOOGLE_API_KEY".to_string(),
        "github" => "GITHUB_TOKEN".to_string(),
        other => format!("{}_API_KEY", other.to_uppercase().replace('-', "_")),
    }
}

fn provider_for(provider: &str) -> Option<ProviderId> {
    match provider {
        "anthropic" | "claude" => Some(ProviderId::Claude),
        "openai" => Some(ProviderId::Openai),
        "google" | "gemini" => Some(ProviderId::Gemini),
        "ollama-cloud" => Some(ProviderId::OllamaCloud),
        _ => None,
    }
}
