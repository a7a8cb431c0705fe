use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ubridge_core::types::{FinishReason, Message, ProviderId, Role, ToolCall, Usage};

use crate::adapter::{
    classify_status, classify_transport, retry_after_ms, ChatRequest, ChatResponse, Health,
    ProviderAdapter, ProviderError,
};
use crate::pricing;
use crate::stream::{LineBuffer, StreamEvent};

pub struct GeminiAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout_ms: u64,
}

impl GeminiAdapter {
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
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
            model: model.unwrap_or_else(|| "gemini-2.0-flash".to_string()),
            timeout_ms,
        }
    }

    async fn post_json(
        &self,
        url: String,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(e, self.timeout_ms))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry = retry_after_ms(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            warn!(status, "Gemini API error");
            return Err(classify_status(status, retry, text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn health(&self) -> Health {
        let url = format!(
            "{}/v1beta/models?pageSize=1&key={}",
            self.base_url, self.api_key
        );
        let start = Instant::now();
        let result = self.client.get(&url).send().await;
        let latency = start.elapsed().as_millis() as u64;

        match result {
            Ok(resp) if resp.status().is_success() => Health::ok(latency),
            Ok(resp) => Health::unhealthy(latency, format!("probe status {}", resp.status())),
            Err(e) => Health::unhealthy(latency, e.to_string()),
        }
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(req);
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, req.model, self.api_key
        );
        debug!(model = %req.model, "sending request to Gemini");

        let start = Instant::now();
        let resp = self.post_json(url, &body).await?;
        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        parse_response(api_resp, &req.model, start.elapsed().as_millis() as u64)
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req);
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, req.model, self.api_key
        );
        debug!(model = %req.model, "sending streaming request to Gemini");

        let resp = self.post_json(url, &body).await?;
        process_stream(resp, req.model.clone(), tx).await;
        Ok(())
    }

    async fn models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/v1beta/models?key={}", self.base_url, self.api_key);
        let resp = self
            .client
            .get(&url)
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
        Ok(list
            .models
            .into_iter()
            .map(|m| m.name.strip_prefix("models/").unwrap_or(&m.name).to_string())
            .collect())
    }
}

/// Find the tool name a result message answers: Gemini keys function
/// responses by name, not call id, so walk back to the requesting call.
fn tool_name_for(messages: &[Message], call_id: &str) -> Option<String> {
    messages.iter().rev().find_map(|m| {
        m.tool_calls
            .iter()
            .find(|c| c.id == call_id)
            .map(|c| c.name.clone())
    })
}

pub(crate) fn build_request_body(req: &ChatRequest) -> serde_json::Value {
    let mut contents: Vec<serde_json::Value> = Vec::new();

    for msg in &req.messages {
        match msg.role {
            Role::User => contents.push(serde_json::json!({
                "role": "user",
                "parts": [{ "text": msg.content }],
            })),
            Role::Assistant => {
                let mut parts: Vec<serde_json::Value> = Vec::new();
                if !msg.content.is_empty() {
                    parts.push(serde_json::json!({ "text": msg.content }));
                }
                for call in &msg.tool_calls {
                    parts.push(serde_json::json!({
                        "functionCall": { "name": call.name, "args": call.args },
                    }));
                }
                contents.push(serde_json::json!({ "role": "model", "parts": parts }));
            }
            Role::Tool => {
                let name = msg
                    .tool_call_id
                    .as_deref()
                    .and_then(|id| tool_name_for(&req.messages, id))
                    .unwrap_or_default();
                let response: serde_json::Value = serde_json::from_str(&msg.content)
                    .unwrap_or_else(|_| serde_json::json!({ "content": msg.content }));
                contents.push(serde_json::json!({
                    "role": "user",
                    "parts": [{ "functionResponse": { "name": name, "response": response } }],
                }));
            }
            // System content travels in systemInstruction.
            Role::System => {}
        }
    }

    let mut body = serde_json::json!({
        "contents": contents,
        "generationConfig": {
            "temperature": req.temperature,
            "maxOutputTokens": req.max_tokens,
        },
    });

    if !req.system.is_empty() {
        body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": req.system }] });
    }

    if !req.tools.is_empty() {
        let declarations: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.input_schema,
                })
            })
            .collect();
        body["tools"] = serde_json::json!([{ "functionDeclarations": declarations }]);
    }

    body
}

fn finish_from_reason(reason: &str, has_tool_calls: bool) -> FinishReason {
    if has_tool_calls {
        return FinishReason::ToolCalls;
    }
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => {
            FinishReason::ContentFilter
        }
        _ => FinishReason::Stop,
    }
}

fn parse_response(
    resp: ApiResponse,
    model: &str,
    latency_ms: u64,
) -> Result<ChatResponse, ProviderError> {
    let candidate = resp
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Parse("response has no candidates".to_string()))?;

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(text) = part.text {
            text_parts.push(text);
        }
        if let Some(call) = part.function_call {
            // Gemini has no call ids; synthesize one so the tool loop can
            // key results the same way it does for other providers.
            tool_calls.push(ToolCall {
                id: format!("call_{}", uuid::Uuid::new_v4()),
                name: call.name,
                args: call.args.unwrap_or(serde_json::Value::Object(Default::default())),
            });
        }
    }

    let usage = resp.usage_metadata.unwrap_or_default();
    let cost = pricing::cost(model, usage.prompt_token_count, usage.candidates_token_count);
    let finish = finish_from_reason(
        candidate.finish_reason.as_deref().unwrap_or_default(),
        !tool_calls.is_empty(),
    );

    Ok(ChatResponse {
        content: text_parts.join(""),
        tool_calls,
        finish_reason: finish,
        usage: Usage::new(usage.prompt_token_count, usage.candidates_token_count, cost),
        model: model.to_string(),
        latency_ms,
    })
}

/// Gemini streams SSE `data:` lines, each a full GenerateContentResponse
/// chunk; the last carries finishReason and usageMetadata.
async fn process_stream(resp: reqwest::Response, model: String, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut finish = String::new();
    let mut saw_tool_call = false;
    let mut lines = LineBuffer::new();

    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
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

            let chunk: ApiResponse = match serde_json::from_str(data) {
                Ok(c) => c,
                Err(e) => {
                    warn!(err = %e, "failed to parse Gemini stream chunk");
                    continue;
                }
            };

            if let Some(usage) = chunk.usage_metadata {
                tokens_in = usage.prompt_token_count;
                tokens_out = usage.candidates_token_count;
            }

            for candidate in chunk.candidates {
                if let Some(reason) = candidate.finish_reason {
                    finish = reason;
                }
                for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
                    if let Some(text) = part.text {
                        if !text.is_empty()
                            && tx.send(StreamEvent::TextDelta { text }).await.is_err()
                        {
                            return; // receiver dropped
                        }
                    }
                    if let Some(call) = part.function_call {
                        saw_tool_call = true;
                        let event = StreamEvent::ToolUse {
                            id: format!("call_{}", uuid::Uuid::new_v4()),
                            name: call.name,
                            args: call
                                .args
                                .unwrap_or(serde_json::Value::Object(Default::default())),
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    let _ = tx
        .send(StreamEvent::Done {
            model,
            tokens_in,
            tokens_out,
            finish_reason: finish_from_reason(&finish, saw_tool_call),
        })
        .await;
}

// Gemini API response types (private: deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<FunctionCall>,
}

#[derive(Deserialize)]
struct FunctionCall {
    name: String,
    args: Option<serde_json::Value>,
}

#[derive(Deserialize, Default)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
}
