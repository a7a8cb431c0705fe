use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use ubridge_core::types::{FinishReason, Message, ProviderId, ToolCall, ToolDefinition, Usage};

use crate::stream::StreamEvent;

/// Request to an LLM provider. The message history is in canonical form; the
/// system prompt is lifted out so each adapter can place it where its wire
/// format wants it.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub tools: Vec<ToolDefinition>,
}

/// Response from an LLM provider (non-streaming).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub model: String,
    pub latency_ms: u64,
}

/// Result of a cheap health probe against the provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Health {
    pub fn ok(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms,
            error: None,
        }
    }

    pub fn unhealthy(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms,
            error: Some(ubridge_core::redact::redact(&error.into())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("credentials rejected ({status}): {message}")]
    AuthInvalid { status: u16, message: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Map a reqwest transport error onto the taxonomy: timeouts become
/// `Timeout`, connection failures become `Unavailable`, the rest stay HTTP.
pub fn classify_transport(e: reqwest::Error, timeout_ms: u64) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout { ms: timeout_ms }
    } else if e.is_connect() {
        ProviderError::Unavailable(e.to_string())
    } else {
        ProviderError::Http(e)
    }
}

/// Map an upstream non-success status onto the taxonomy. 401/403 are auth
/// failures, 429 carries the retry-after header when present.
pub fn classify_status(status: u16, retry_after_ms: Option<u64>, body: String) -> ProviderError {
    match status {
        401 | 403 => ProviderError::AuthInvalid {
            status,
            message: body,
        },
        429 => ProviderError::RateLimited {
            retry_after_ms: retry_after_ms.unwrap_or(5000),
        },
        _ => ProviderError::Api {
            status,
            message: body,
        },
    }
}

/// Read a Retry-After header (seconds) into milliseconds.
pub fn retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|secs| secs * 1000)
}

/// Common interface for all providers. One variant per upstream API; the two
/// Ollama registry slots share a variant and differ only in endpoint/bearer.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which registry slot this adapter fills.
    fn id(&self) -> ProviderId;

    /// Model used when a session doesn't override one.
    fn default_model(&self) -> &str;

    /// Cheap probe against a read-only route.
    async fn health(&self) -> Health;

    /// One-shot completion over the full message history.
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Stream response events through a channel. A dropped receiver aborts
    /// the upstream read. Default: non-streaming send, emitted as one delta.
    async fn chat_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let resp = self.chat(req).await?;
        if !resp.content.is_empty() {
            let _ = tx
                .send(StreamEvent::TextDelta {
                    text: resp.content.clone(),
                })
                .await;
        }
        let _ = tx
            .send(StreamEvent::Done {
                model: resp.model,
                tokens_in: resp.usage.input_tokens,
                tokens_out: resp.usage.output_tokens,
                finish_reason: resp.finish_reason,
            })
            .await;
        Ok(())
    }

    /// Models the upstream currently serves.
    async fn models(&self) -> Result<Vec<String>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(401, None, "no".into()),
            ProviderError::AuthInvalid { status: 401, .. }
        ));
        assert!(matches!(
            classify_status(429, Some(2000), "slow down".into()),
            ProviderError::RateLimited {
                retry_after_ms: 2000
            }
        ));
        assert!(matches!(
            classify_status(429, None, "slow down".into()),
            ProviderError::RateLimited {
                retry_after_ms: 5000
            }
        ));
        assert!(matches!(
            classify_status(503, None, "down".into()),
            ProviderError::Api { status: 503, .. }
        ));
    }

    #[test]
    fn unhealthy_probe_redacts_keys() {
        let health = Health::unhealthy(12, "key sk-ant-api03-secretsecret rejected");
        assert!(!health.error.as_deref().unwrap().contains("secretsecret"));
    }
}
