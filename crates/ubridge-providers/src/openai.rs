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
use crate::pricing;
use crate::stream::{LineBuffer, StreamEvent};

pub struct OpenAiAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout_ms: u64,
}

impl OpenAiAdapter {
    pub fn new(
        client: reqwest::Client,
        api_key: String,
        base_url: Option<String>,
        model: Option<String>,
        timeout_ms: u64,
    ) -> Self {
        Self {
            client,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".to_string()),
            model: model.unwrap_or_else(|| "gpt-4o".to_string()),
            timeout_ms,
        }
    }

    async fn send_completions(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(e, self.timeout_ms))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry = retry_after_ms(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            warn!(status, "OpenAI API error");
            return Err(classify_status(status, retry, text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Openai
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn health(&self) -> Health {
        let url = format!("{}/v1/models", self.base_url);
        let start = Instant::now();
        let result = self.client.get(&url).bearer_auth(&self.api_key).send().await;
        let latency = start.elapsed().as_millis() as u64;

        match result {
            Ok(resp) if resp.status().is_success() => Health::ok(latency),
            Ok(resp) => Health::unhealthy(latency, format!("probe status {}", resp.status())),
            Err(e) => Health::unhealthy(latency, e.to_string()),
        }
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(req, false);
        debug!(model = %req.model, "sending request to OpenAI");

        let start = Instant::now();
        let resp = self.send_completions(&body).await?;
        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        parse_response(api_resp, start.elapsed().as_millis() as u64)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let mut body = build_request_body(req, true);
        body["stream_options"] = serde_json::json!({ "include_usage": true });
        debug!(model = %req.model, "sending streaming request to OpenAI");

        let resp = self.send_completions(&body).await?;
        process_stream(resp, tx).await;
        Ok(())
    }

    async fn models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/v1/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| classify_transport(e, self.timeout_ms))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry = retry_after_ms(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry, text));
        }

        let list: ModelList = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

/// Map the canonical message log onto the chat-completions wire format.
pub(crate) fn build_request_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
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
                let mut wire = serde_json::json!({ "role": "assistant" });
                wire["content"] = if msg.content.is_empty() {
                    serde_json::Value::Null
                } else {
                    serde_json::Value::String(msg.content.clone())
                };
                if !msg.tool_calls.is_empty() {
                    let calls: Vec<serde_json::Value> = msg
                        .tool_calls
                        .iter()
                        .map(|c| {
                            serde_json::json!({
                                "id": c.id,
                                "type": "function",
                                "function": {
                                    "name": c.name,
                                    "arguments": c.args.to_string(),
                                },
                            })
                        })
                        .collect();
                    wire["tool_calls"] = serde_json::Value::Array(calls);
                }
                messages.push(wire);
            }
            Role::Tool => {
                messages.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content,
                }));
            }
        }
    }

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "temperature": req.temperature,
        "max_tokens": req.max_tokens,
        "stream": stream,
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

fn finish_from_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn parse_response(resp: ApiResponse, latency_ms: u64) -> Result<ChatResponse, ProviderError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Parse("response has no choices".to_string()))?;

    let message = choice
        .message
        .ok_or_else(|| ProviderError::Parse("choice has no message".to_string()))?;

    let tool_calls: Vec<ToolCall> = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|c| ToolCall {
            id: c.id,
            name: c.function.name,
            // OpenAI ships arguments as a JSON string; flatten to a value.
            args: serde_json::from_str(&c.function.arguments)
                .unwrap_or(serde_json::Value::Object(Default::default())),
        })
        .collect();

    let usage = resp.usage.unwrap_or_default();
    let cost = pricing::cost(&resp.model, usage.prompt_tokens, usage.completion_tokens);

    Ok(ChatResponse {
        content: message.content.unwrap_or_default(),
        tool_calls,
        finish_reason: finish_from_reason(choice.finish_reason.as_deref().unwrap_or_default()),
        usage: Usage::new(usage.prompt_tokens, usage.completion_tokens, cost),
        model: resp.model,
        latency_ms,
    })
}

/// Parse the chat-completions SSE stream: `data: <chunk>` lines terminated by
/// `data: [DONE]`. Tool-call fragments are accumulated by index.
async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut model = String::new();
    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut finish = String::new();
    let mut lines = LineBuffer::new();
    // index -> (id, name, accumulated argument json)
    let mut partial_calls: Vec<(String, String, String)> = Vec::new();

    let mut byte_stream = resp.bytes_stream();

    'outer: while let Some(chunk) = byte_stream.next().await {
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
            let Some(data) = line.trim().strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                break 'outer;
            }

            let chunk: StreamChunk = match serde_json::from_str(data) {
                Ok(c) => c,
                Err(e) => {
                    warn!(err = %e, "failed to parse OpenAI stream chunk");
                    continue;
                }
            };

            if model.is_empty() {
                model = chunk.model.clone();
            }
            if let Some(usage) = chunk.usage {
                tokens_in = usage.prompt_tokens;
                tokens_out = usage.completion_tokens;
            }

            let Some(choice) = chunk.choices.into_iter().next() else {
                continue;
            };
            if let Some(reason) = choice.finish_reason {
                finish = reason;
            }
            let Some(delta) = choice.delta else {
                continue;
            };

            if let Some(text) = delta.content {
                if !text.is_empty() && tx.send(StreamEvent::TextDelta { text }).await.is_err() {
                    return; // receiver dropped
                }
            }

            for frag in delta.tool_calls.unwrap_or_default() {
                let idx = frag.index as usize;
                if partial_calls.len() <= idx {
                    partial_calls.resize(idx + 1, Default::default());
                }
                let slot = &mut partial_calls[idx];
                if let Some(id) = frag.id {
                    slot.0 = id;
                }
                if let Some(func) = frag.function {
                    if let Some(name) = func.name {
                        slot.1 = name;
                    }
                    if let Some(arguments) = func.arguments {
                        slot.2.push_str(&arguments);
                    }
                }
            }
        }
    }

    for (id, name, args_json) in partial_calls {
        if name.is_empty() {
            continue;
        }
        let args = serde_json::from_str(&args_json)
            .unwrap_or(serde_json::Value::Object(Default::default()));
        if tx
            .send(StreamEvent::ToolUse { id, name, args })
            .await
            .is_err()
        {
            return;
        }
    }

    let _ = tx
        .send(StreamEvent::Done {
            model,
            tokens_in,
            tokens_out,
            finish_reason: finish_from_reason(&finish),
        })
        .await;
}

// OpenAI API response types (private: deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: Option<ApiMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize, Default)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

// Streaming chunk types

#[derive(Deserialize)]
struct StreamChunk {
    model: String,
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Deserialize)]
struct ToolCallFragment {
    index: u32,
    id: Option<String>,
    function: Option<FunctionFragment>,
}

#[derive(Deserialize)]
struct FunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}
