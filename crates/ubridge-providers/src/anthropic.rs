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
use crate::stream::StreamEvent;

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    timeout_ms: u64,
}

impl AnthropicAdapter {
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
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            model: model.unwrap_or_else(|| "claude-sonnet-4-5".to_string()),
            timeout_ms,
        }
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
    }

    async fn send_messages(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let resp = self
            .request(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(e, self.timeout_ms))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry = retry_after_ms(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            warn!(status, "Anthropic API error");
            return Err(classify_status(status, retry, text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Claude
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn health(&self) -> Health {
        let url = format!("{}/v1/models?limit=1", self.base_url);
        let start = Instant::now();
        let result = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .send()
            .await;
        let latency = start.elapsed().as_millis() as u64;

        match result {
            Ok(resp) if resp.status().is_success() => Health::ok(latency),
            Ok(resp) => Health::unhealthy(latency, format!("probe status {}", resp.status())),
            Err(e) => Health::unhealthy(latency, e.to_string()),
        }
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_request_body(req, false);
        debug!(model = %req.model, "sending request to Anthropic");

        let start = Instant::now();
        let resp = self.send_messages(&body).await?;
        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;

        Ok(parse_response(api_resp, start.elapsed().as_millis() as u64))
    }

    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, true);
        debug!(model = %req.model, "sending streaming request to Anthropic");

        let resp = self.send_messages(&body).await?;
        crate::anthropic_stream::process_stream(resp, tx).await;
        Ok(())
    }

    async fn models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/v1/models", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
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

/// Map the canonical message log onto Anthropic's wire format. Assistant
/// tool calls become `tool_use` content blocks; tool-role messages become
/// `tool_result` blocks inside a user turn. Consecutive same-role turns are
/// merged because the API requires alternation.
pub(crate) fn build_request_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
    let mut wire: Vec<(&'static str, Vec<serde_json::Value>)> = Vec::new();

    let mut push_block = |role: &'static str, block: serde_json::Value| {
        match wire.last_mut() {
            Some((last_role, blocks)) if *last_role == role => blocks.push(block),
            _ => wire.push((role, vec![block])),
        }
    };

    for msg in &req.messages {
        match msg.role {
            Role::User => {
                push_block("user", serde_json::json!({ "type": "text", "text": msg.content }));
            }
            Role::Assistant => {
                if !msg.content.is_empty() {
                    push_block(
                        "assistant",
                        serde_json::json!({ "type": "text", "text": msg.content }),
                    );
                }
                for call in &msg.tool_calls {
                    push_block(
                        "assistant",
                        serde_json::json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.args,
                        }),
                    );
                }
            }
            Role::Tool => {
                push_block(
                    "user",
                    serde_json::json!({
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                        "content": msg.content,
                    }),
                );
            }
            // System content travels in the top-level `system` field.
            Role::System => {}
        }
    }

    let messages: Vec<serde_json::Value> = wire
        .into_iter()
        .map(|(role, blocks)| serde_json::json!({ "role": role, "content": blocks }))
        .collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "max_tokens": req.max_tokens,
        "temperature": req.temperature,
        "messages": messages,
        "stream": stream,
    });

    if !req.system.is_empty() {
        body["system"] = serde_json::Value::String(req.system.clone());
    }

    if !req.tools.is_empty() {
        let tools: Vec<serde_json::Value> = req
            .tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }

    body
}

pub(crate) fn finish_from_stop_reason(stop_reason: &str) -> FinishReason {
    match stop_reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

fn parse_response(resp: ApiResponse, latency_ms: u64) -> ChatResponse {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in resp.content {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall {
                    id,
                    name,
                    args: input,
                });
            }
            ContentBlock::Unknown => {}
        }
    }

    let tokens_in = resp.usage.input_tokens;
    let tokens_out = resp.usage.output_tokens;
    let cost = pricing::cost(&resp.model, tokens_in, tokens_out);

    ChatResponse {
        content: text_parts.join(""),
        tool_calls,
        finish_reason: finish_from_stop_reason(resp.stop_reason.as_deref().unwrap_or_default()),
        usage: Usage::new(tokens_in, tokens_out, cost),
        model: resp.model,
        latency_ms,
    }
}

// Anthropic API response types (private: deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubridge_core::types::Message;

    fn request_with(messages: Vec<Message>) -> ChatRequest {
        ChatRequest {
            model: "claude-sonnet-4-5".into(),
            system: "SYS".into(),
            messages,
            temperature: 0.0,
            max_tokens: 128,
            tools: Vec::new(),
        }
    }

    #[test]
    fn body_lifts_system_prompt() {
        let body = build_request_body(&request_with(vec![Message::user("hi")]), false);
        assert_eq!(body["system"], "SYS");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["text"], "hi");
    }

    #[test]
    fn tool_results_merge_into_one_user_turn() {
        let assistant = Message::assistant("").with_tool_calls(vec![
            ToolCall {
                id: "t1".into(),
                name: "search".into(),
                args: serde_json::json!({"q": "x"}),
            },
            ToolCall {
                id: "t2".into(),
                name: "search".into(),
                args: serde_json::json!({"q": "y"}),
            },
        ]);
        let messages = vec![
            Message::user("go"),
            assistant,
            Message::tool_result("t1", "a"),
            Message::tool_result("t2", "b"),
        ];
        let body = build_request_body(&request_with(messages), false);
        let wire = body["messages"].as_array().unwrap();
        // user, assistant(tool_use x2), user(tool_result x2)
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[1]["content"].as_array().unwrap().len(), 2);
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][1]["tool_use_id"], "t2");
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(finish_from_stop_reason("end_turn"), FinishReason::Stop);
        assert_eq!(finish_from_stop_reason("max_tokens"), FinishReason::Length);
        assert_eq!(finish_from_stop_reason("tool_use"), FinishReason::ToolCalls);
    }
}
