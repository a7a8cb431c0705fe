//! Decoder for Anthropic's messages SSE stream.
//!
//! The wire interleaves `event:` and `data:` lines. Content arrives as typed
//! blocks: `content_block_start` opens a text or tool_use block, deltas fill
//! it, `content_block_stop` closes it. Token counts are split across the
//! stream: input on `message_start`, output on `message_delta`. The decoder
//! tracks the open block and the running totals, and the bridge turns the
//! assembled events into one assistant message per turn.

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::anthropic::finish_from_stop_reason;
use crate::stream::{LineBuffer, StreamEvent};

/// Drain the HTTP response into [`StreamEvent`]s. Returns as soon as the
/// receiver goes away; that is the cancellation path.
pub async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut lines = LineBuffer::new();
    let mut decoder = SseDecoder::new();
    let mut body = resp.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        for line in lines.push(&chunk) {
            if let Some(event) = decoder.accept(&line) {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }

    let _ = tx.send(decoder.into_done()).await;
}

/// The content block currently streaming.
enum Block {
    Idle,
    Text,
    /// Tool input arrives as JSON fragments; assembled at block stop.
    ToolUse {
        id: String,
        name: String,
        args_json: String,
    },
}

/// State machine over the SSE event/data line pairs.
struct SseDecoder {
    /// Name from the most recent `event:` line; applies to the next `data:`.
    current_event: String,
    block: Block,
    model: String,
    tokens_in: u32,
    tokens_out: u32,
    stop_reason: String,
}

impl SseDecoder {
    fn new() -> Self {
        Self {
            current_event: String::new(),
            block: Block::Idle,
            model: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            stop_reason: String::new(),
        }
    }

    /// Feed one wire line. Emits at most one event per line.
    fn accept(&mut self, line: &str) -> Option<StreamEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if let Some(name) = line.strip_prefix("event: ") {
            self.current_event = name.to_string();
            return None;
        }
        let data = line.strip_prefix("data: ")?;

        if self.current_event == "error" {
            warn!(data, "anthropic stream error");
            return Some(StreamEvent::Error {
                message: data.to_string(),
            });
        }

        let payload: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                warn!(err = %e, "unparseable SSE payload");
                return None;
            }
        };
        self.on_payload(&payload)
    }

    fn on_payload(&mut self, payload: &Value) -> Option<StreamEvent> {
        match self.current_event.as_str() {
            "message_start" => {
                self.model = str_at(payload, "/message/model");
                self.tokens_in = u32_at(payload, "/message/usage/input_tokens");
                None
            }

            "content_block_start" => {
                self.block = match payload.pointer("/content_block/type").and_then(Value::as_str)
                {
                    Some("tool_use") => Block::ToolUse {
                        id: str_at(payload, "/content_block/id"),
                        name: str_at(payload, "/content_block/name"),
                        args_json: String::new(),
                    },
                    _ => Block::Text,
                };
                None
            }

            "content_block_delta" => {
                match payload.pointer("/delta/type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = str_at(payload, "/delta/text");
                        if text.is_empty() {
                            None
                        } else {
                            debug!(len = text.len(), "stream text delta");
                            Some(StreamEvent::TextDelta { text })
                        }
                    }
                    Some("input_json_delta") => {
                        if let Block::ToolUse { args_json, .. } = &mut self.block {
                            args_json.push_str(&str_at(payload, "/delta/partial_json"));
                        }
                        None
                    }
                    other => {
                        debug!(delta_type = other.unwrap_or("?"), "unhandled delta type");
                        None
                    }
                }
            }

            "content_block_stop" => match std::mem::replace(&mut self.block, Block::Idle) {
                Block::ToolUse {
                    id,
                    name,
                    args_json,
                } => {
                    let args = serde_json::from_str(&args_json)
                        .unwrap_or(Value::Object(Default::default()));
                    Some(StreamEvent::ToolUse { id, name, args })
                }
                _ => None,
            },

            "message_delta" => {
                if let Some(n) = payload.pointer("/usage/output_tokens").and_then(Value::as_u64)
                {
                    self.tokens_out = n as u32;
                }
                if let Some(reason) =
                    payload.pointer("/delta/stop_reason").and_then(Value::as_str)
                {
                    self.stop_reason = reason.to_string();
                }
                None
            }

            // message_stop, ping and anything newer carry nothing we track.
            _ => None,
        }
    }

    fn into_done(self) -> StreamEvent {
        StreamEvent::Done {
            model: self.model,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            finish_reason: finish_from_stop_reason(&self.stop_reason),
        }
    }
}

fn str_at(payload: &Value, pointer: &str) -> String {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn u32_at(payload: &Value, pointer: &str) -> u32 {
    payload
        .pointer(pointer)
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32
}
