use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use ubridge_core::types::{FinishReason, ToolCall, Usage};

use crate::app::AppState;
use crate::audit::AuditInfo;
use crate::error::{parse_body, ApiError};
use crate::middleware::Identity;
use crate::orchestrator::{self, ChatOutcome, ToolResultInput};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    pub session_id: String,
    pub message: String,
    #[serde(default)]
    pub streaming: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsRequestBody {
    pub session_id: String,
    pub tool_results: Vec<ToolResultInput>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub response: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub model: String,
    pub latency: u64,
}

fn outcome_response(session_id: &str, outcome: ChatOutcome) -> Response {
    let resp = outcome.response;
    let info = AuditInfo {
        session_id: Some(session_id.to_string()),
        tokens: Some(resp.usage.total_tokens as u64),
        cost: Some(resp.usage.cost),
        ..Default::default()
    };

    let reply = ChatReply {
        response: resp.content,
        tool_calls: resp.tool_calls,
        finish_reason: resp.finish_reason,
        usage: resp.usage,
        model: resp.model,
        // A hit replays the stored response; the recorded latency would lie.
        latency: if outcome.cached { 0 } else { resp.latency_ms },
    };

    let mut response = Json(reply).into_response();
    let cache_header = if outcome.cached { "HIT" } else { "MISS" };
    if let Ok(value) = cache_header.parse() {
        response.headers_mut().insert("X-Cache", value);
    }
    response.extensions_mut().insert(info);
    response
}

/// POST /chat: non-streaming chat turn.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let req: ChatRequestBody = parse_body(
        body,
        state.config.server.strict_body,
        &["sessionId", "message", "streaming"],
    )?;
    if req.streaming {
        return Err(ApiError(ubridge_core::error::BridgeError::invalid_argument(
            "streaming",
            "use POST /chat/stream for streaming responses",
        )));
    }

    let outcome = orchestrator::chat(&state, &req.session_id, &req.message, &identity.0).await?;
    Ok(outcome_response(&req.session_id, outcome))
}

/// POST /tools: submit tool results, resuming the tool loop.
pub async fn tools_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let req: ToolsRequestBody = parse_body(
        body,
        state.config.server.strict_body,
        &["sessionId", "toolResults"],
    )?;

    let outcome = orchestrator::submit_tool_results(
        &state,
        &req.session_id,
        req.tool_results,
        &identity.0,
    )
    .await?;
    Ok(outcome_response(&req.session_id, outcome))
}
