use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ubridge_core::types::{FinishReason, ProviderId, Role, ToolCall, Usage};

use crate::adapter::{
    classify_status, classify_transport, retry_after_ms, ChatRequest, ChatResponse, Health,
    ProviderAdapter, ProviderError,
};
use crate::stream::{LineBuffer, StreamEvent};

/// Ollama adapter. The local and cloud registry slots are two instances of
/// this struct: same wire protocol, different base URL and optional bearer.
pub struct OllamaAdapter {
    client: reqwest::Client,
    id: ProviderId,
    base_url: String,
    bearer: Option<String>,
    model: String,
    timeout_ms: u64,
}

impl OllamaAdapter {
    pub fn new(
        client: reqwest::Client,
        id: ProviderId,
        base_url: String,
        bearer: Option<String>,
        model: Option<String>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            client,
            id,
            base_url,
            bearer,
            model: model.unwrap_or_else(|| "llama3.2".to_string()),
            timeout_ms,
        }
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send_chat(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/api/chat", self.base_url);
        let builder = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(body);

        let resp = self
            .with_auth(builder)
            .send()
            .await
            .map_err(|e| classify_transport(e, self.timeout_ms))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry = retry_after_ms(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            warn!(status, "Ollama API error");
            return Err(classify_status(status, retry, text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn health(&self) -> Health {
        let url = format!("{}/api/tags", self.base_url);
        let start = Instant::now();
        let result = self.with_auth(self.client.get(&url)).send().await;
        let latency = start.elapsed().as_millis() as u64;

        match result {
            Ok(resp) if resp.status().is_success() => Health::ok(latency),
            Ok(resp) => Health::unhealthy(latency, format!("probe status {}", resp.status())),
            Err(e) => Health::unhealthy(latency, e.to_string()),
        }
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(req, false);
        debug!(model = %req.model, id = %self.id, "sending request to Ollama");

        let start = Instant::now();
        let resp = self.send_chat(&body).await?;
        let wire: WireChunk = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(response_from_wire(wire, start.elapsed().as_millis() as u64))
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, true);
        debug!(model = %req.model, id = %self.id, "sending streaming request to Ollama");

        let resp = self.send_chat(&body).await?;
        process_stream(resp, tx).await;
        Ok(())
    }

    async fn models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self
            .with_auth(self.client.get(&url))
            .send()
            .await
            .map_err(|e| classify_transport(e, self.timeout_ms))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry = retry_after_ms(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry, text));
        }

        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }
}

fn build_request_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = Vec::new();

    if !req.system.is_empty() {
        messages.push(serde_json::json!({ "role": "system", "content": req.system }));
    }

    for msg in &req.messages {
        match msg.role {
            Role::System => {
                messages.push(serde_json::json!({ "role": "system", "content": msg.content }));
            }
            Role::User => {
                messages.push(serde_json::json!({ "role": "user", "content": msg.content }));
            }
            Role::Assistant => {
                let mut wire = serde_json::json!({
                    "role": "assistant",
                    "content": msg.content,
                });
                if !msg.tool_calls.is_empty() {
                    let calls: Vec<serde_json::Value> = msg
                        .tool_calls
                        .iter()
                        .map(|c| {
                            serde_json::json!({
                                "function": { "name": c.name, "arguments": c.args },
                            })
                        })
                        .collect();
                    wire["tool_calls"] = serde_json::Value::Array(calls);
                }
                messages.push(wire);
            }
            Role::Tool => {
                messages.push(serde_json::json!({ "role": "tool", "content": msg.content }));
            }
        }
    }

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "stream": stream,
        "options": {
            "temperature": req.temperature,
            "num_predict": req.max_tokens,
        },
    });

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    },
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    body
}

fn map_tool_calls(calls: Vec<WireToolCall>) -> Vec<ToolCall> {
    calls
        .into_iter()
        .map(|c| ToolCall {
            // Ollama has no call ids; synthesize so the loop can key results.
            id: format!("call_{}", uuid::Uuid::new_v4()),
            name: c.function.name,
            args: c.function.arguments,
        })
        .collect()
}

fn finish_from_done(done_reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    if has_tool_calls {
        return FinishReason::ToolCalls;
    }
    match done_reason.unwrap_or("stop") {
        "length" | "limit" => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

fn response_from_wire(wire: WireChunk, latency_ms: u64) -> ChatResponse {
    let tool_calls = map_tool_calls(wire.message.tool_calls.unwrap_or_default());
    let tokens_in = wire.prompt_eval_count.unwrap_or(0);
    let tokens_out = wire.eval_count.unwrap_or(0);
    let finish = finish_from_done(wire.done_reason.as_deref(), !tool_calls.is_empty());

    ChatResponse {
        content: wire.message.content,
        tool_calls,
        finish_reason: finish,
        // Local inference is free; the price table has no Ollama rows.
        usage: Usage::new(tokens_in, tokens_out, 0.0),
        model: wire.model,
        latency_ms,
    }
}

/// Drain the NDJSON stream. Every line is a [`WireChunk`]; the accumulator
/// turns each into zero or more events and keeps the totals the final chunk
/// reports.
async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut lines = LineBuffer::new();
    let mut summary = StreamSummary::default();
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
            if line.trim().is_empty() {
                continue;
            }
            let wire: WireChunk = match serde_json::from_str(&line) {
                Ok(w) => w,
                Err(e) => {
                    warn!(%line, err = %e, "unparseable Ollama stream line");
                    continue;
                }
            };
            for event in summary.absorb(wire) {
                if tx.send(event).await.is_err() {
                    return; // receiver dropped
                }
            }
        }
    }

    let _ = tx.send(summary.into_done()).await;
}

/// Running state of one streamed completion.
#[derive(Default)]
struct StreamSummary {
    model: String,
    tokens_in: u32,
    tokens_out: u32,
    done_reason: Option<String>,
    saw_tool_call: bool,
}

impl StreamSummary {
    /// Fold one wire chunk in, yielding the events it carries. The chunk with
    /// `done: true` carries stats instead of content.
    fn absorb(&mut self, wire: WireChunk) -> Vec<StreamEvent> {
        if self.model.is_empty() {
            self.model = wire.model;
        }

        let mut events = Vec::new();
        for call in map_tool_calls(wire.message.tool_calls.unwrap_or_default()) {
            self.saw_tool_call = true;
            events.push(StreamEvent::ToolUse {
                id: call.id,
                name: call.name,
                args: call.args,
            });
        }

        if wire.done {
            self.tokens_in = wire.prompt_eval_count.unwrap_or(0);
            self.tokens_out = wire.eval_count.unwrap_or(0);
            self.done_reason = wire.done_reason;
        } else if !wire.message.content.is_empty() {
            debug!(len = wire.message.content.len(), "ollama stream text delta");
            events.push(StreamEvent::TextDelta {
                text: wire.message.content,
            });
        }
        events
    }

    fn into_done(self) -> StreamEvent {
        StreamEvent::Done {
            model: self.model,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            finish_reason: finish_from_done(self.done_reason.as_deref(), self.saw_tool_call),
        }
    }
}

// Ollama wire types. The one-shot response and each stream line share a
// shape; `done` distinguishes the stats-bearing final chunk.

#[derive(Deserialize)]
struct WireChunk {
    model: String,
    message: WireMessage,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
    prompt_eval_count: Option<u32>,
    eval_count: Option<u32>,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: String,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: serde_json::Value,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubridge_core::types::Message;

    #[test]
    fn body_includes_temperature_option() {
        let req = ChatRequest {
            model: "llama3.2".into(),
            system: "SYS".into(),
            messages: vec![Message::user("hi")],
            temperature: 0.3,
            max_tokens: 99,
            tools: vec![],
        };
        let body = build_request_body(&req, true);
        assert_eq!(body["options"]["num_predict"], 99);
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
    }

    #[test]
    fn finish_maps_length_and_tools() {
        assert_eq!(finish_from_done(Some("length"), false), FinishReason::Length);
        assert_eq!(finish_from_done(Some("stop"), true), FinishReason::ToolCalls);
        assert_eq!(finish_from_done(None, false), FinishReason::Stop);
    }

    fn wire(line: &str) -> WireChunk {
        serde_json::from_str(line).unwrap()
    }

    #[test]
    fn summary_folds_deltas_then_final_stats() {
        let mut summary = StreamSummary::default();

        let events = summary.absorb(wire(
            r#"{"model":"llama3.2","message":{"content":"he"},"done":false}"#,
        ));
        assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "he"));

        let events = summary.absorb(wire(
            r#"{"model":"llama3.2","message":{"content":"llo"},"done":false}"#,
        ));
        assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "llo"));

        let events = summary.absorb(wire(
            r#"{"model":"llama3.2","message":{"content":""},"done":true,
                "done_reason":"stop","prompt_eval_count":7,"eval_count":4}"#,
        ));
        assert!(events.is_empty(), "the final chunk carries stats, not content");

        match summary.into_done() {
            StreamEvent::Done {
                model,
                tokens_in,
                tokens_out,
                finish_reason,
            } => {
                assert_eq!(model, "llama3.2");
                assert_eq!(tokens_in, 7);
                assert_eq!(tokens_out, 4);
                assert_eq!(finish_reason, FinishReason::Stop);
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn summary_surfaces_tool_calls_with_synthesized_ids() {
        let mut summary = StreamSummary::default();
        let events = summary.absorb(wire(
            r#"{"model":"llama3.2","message":{"content":"",
                "tool_calls":[{"function":{"name":"search","arguments":{"q":"x"}}}]},
                "done":false}"#,
        ));
        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::ToolUse { id, name, args } => {
                assert!(id.starts_with("call_"));
                assert_eq!(name, "search");
                assert_eq!(args["q"], "x");
            }
            other => panic!("expected ToolUse, got {other:?}"),
        }

        // A tool call anywhere in the stream forces the tool_calls finish.
        assert!(matches!(
            summary.into_done(),
            StreamEvent::Done {
                finish_reason: FinishReason::ToolCalls,
                ..
            }
        ));
    }
}
