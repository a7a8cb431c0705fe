use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{Extension, Json};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::app::AppState;
use crate::error::{parse_body, ApiError};
use crate::middleware::Identity;
use crate::orchestrator;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStreamRequest {
    pub session_id: String,
    pub message: String,
}

/// POST /chat/stream: server-sent events. Each frame is
/// `data: {"delta":"...","done":false}`; the final frame carries usage and
/// the finish reason. Dropping the response aborts the upstream call.
pub async fn chat_stream_handler(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<serde_json::Value>,
) -> Result<Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let req: ChatStreamRequest = parse_body(
        body,
        state.config.server.strict_body,
        &["sessionId", "message", "streaming"],
    )?;

    let rx = orchestrator::chat_stream(&state, &req.session_id, &req.message, &identity.0).await?;

    let stream = ReceiverStream::new(rx).map(|frame| {
        let json = serde_json::to_string(&frame).unwrap_or_default();
        Ok(Event::default().data(json))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
