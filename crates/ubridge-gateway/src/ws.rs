//! WebSocket transport for the capture bus: GET /realtime-capture.
//!
//! One task per connection. Inbound frames are the capture protocol
//! (REGISTER / CREATE_SESSION / EVENT_DATA / END_SESSION); the server
//! answers each with an ACK or ERROR frame.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use std::sync::Arc;
use tracing::{debug, info, warn};

use ubridge_capture::{InboundFrame, OutboundFrame};
use ubridge_core::redact::redact;

use crate::app::AppState;

/// Per-frame payload cap. Event batches stay well under this.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

pub async fn capture_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_connection(socket, state))
}

/// Per-connection task: lives until the client closes or the server stops.
async fn handle_connection(mut socket: WebSocket, state: Arc<AppState>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "capture client connected");
    let shutdown = state.shutdown.clone();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let text_ref: &str = &text;
                        if text_ref.len() > MAX_FRAME_BYTES {
                            warn!(conn_id, size = text_ref.len(), "frame too large, closing");
                            break;
                        }
                        let reply = process_frame(&conn_id, text_ref, &state).await;
                        if send_frame(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn_id, error = %e, "capture socket error");
                        break;
                    }
                    _ => {}
                }
            }
            _ = shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    info!(conn_id, "capture client disconnected");
}

async fn process_frame(conn_id: &str, text: &str, state: &Arc<AppState>) -> OutboundFrame {
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            warn!(conn_id, error = %e, "malformed capture frame");
            return OutboundFrame::Error {
                message: format!("malformed frame: {e}"),
            };
        }
    };

    match frame {
        InboundFrame::Register {
            client_type,
            version,
        } => {
            info!(
                conn_id,
                client_type,
                version = version.as_deref().unwrap_or("-"),
                "capture client registered"
            );
            OutboundFrame::Ack {
                session_id: None,
                event_count: None,
            }
        }

        InboundFrame::CreateSession {
            session_id,
            title,
            platform,
            metadata,
        } => match state
            .capture
            .create_session(&session_id, title, platform, metadata)
            .await
        {
            Ok(session) => OutboundFrame::Ack {
                session_id: Some(session.id),
                event_count: Some(0),
            },
            Err(e) => OutboundFrame::Error {
                message: redact(&e.to_string()),
            },
        },

        InboundFrame::EventData { session_id, events } => {
            match state.capture.append_events(&session_id, events).await {
                Ok(_) => {
                    let count = state
                        .capture
                        .get(&session_id)
                        .await
                        .map(|s| s.event_count)
                        .unwrap_or(0);
                    OutboundFrame::Ack {
                        session_id: Some(session_id),
                        event_count: Some(count),
                    }
                }
                Err(e) => OutboundFrame::Error {
                    message: redact(&e.to_string()),
                },
            }
        }

        InboundFrame::EndSession { session_id } => {
            match state.capture.end_session(&session_id).await {
                Ok(session) => OutboundFrame::Ack {
                    session_id: Some(session.id),
                    event_count: Some(session.event_count),
                },
                Err(e) => OutboundFrame::Error {
                    message: redact(&e.to_string()),
                },
            }
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &OutboundFrame) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).unwrap_or_default();
    socket.send(Message::Text(json.into())).await
}
