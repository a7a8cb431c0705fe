use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The providers this bridge knows how to talk to.
///
/// `ollama-local` and `ollama-cloud` are two registry instances of the same
/// adapter, differing only in base URL and an optional bearer token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderId {
    Claude,
    Openai,
    Gemini,
    OllamaLocal,
    OllamaCloud,
}

impl ProviderId {
    pub const ALL: [ProviderId; 5] = [
        ProviderId::Claude,
        ProviderId::Openai,
        ProviderId::Gemini,
        ProviderId::OllamaLocal,
        ProviderId::OllamaCloud,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Claude => "claude",
            ProviderId::Openai => "openai",
            ProviderId::Gemini => "gemini",
            ProviderId::OllamaLocal => "ollama-local",
            ProviderId::OllamaCloud => "ollama-cloud",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "claude" => Some(ProviderId::Claude),
            "openai" => Some(ProviderId::Openai),
            "gemini" => Some(ProviderId::Gemini),
            "ollama-local" => Some(ProviderId::OllamaLocal),
            "ollama-cloud" => Some(ProviderId::OllamaCloud),
            _ => None,
        }
    }

    /// Local providers are free: their price table is empty.
    pub fn is_local(&self) -> bool {
        matches!(self, ProviderId::OllamaLocal)
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Why a completion stopped. Stable wire names across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
    Cancelled,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Error => "error",
            FinishReason::Cancelled => "cancelled",
        }
    }
}

/// Tool definition advertised to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// Token usage and cost for one response or one session, depending on context.
/// Invariant: `total_tokens == input_tokens + output_tokens`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub cost: f64,
}

impl Usage {
    pub fn new(input: u32, output: u32, cost: f64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            cost,
        }
    }

    /// Fold another usage record into a running total.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens = self.input_tokens + self.output_tokens;
        self.cost += other.cost;
    }
}

/// One element of a session's append-only message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Vec::new(),
            provider: None,
            tokens: None,
            created_at: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// A tool-role message carrying one tool result, keyed by the call id.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_provider(mut self, provider: ProviderId) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }
}

/// Immutable per-session configuration, fixed at session creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub provider: ProviderId,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

impl SessionConfig {
    /// Validate the value ranges the store enforces at session creation.
    /// Returns the offending field name and a human-readable reason.
    pub fn validate(&self) -> Result<(), (&'static str, String)> {
        if !(0.0..=2.0).contains(&self.temperature) || !self.temperature.is_finite() {
            return Err((
                "config.temperature",
                format!("temperature {} outside [0, 2]", self.temperature),
            ));
        }
        if self.max_tokens == 0 {
            return Err(("config.maxTokens", "maxTokens must be positive".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(("config.model", "model must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_roundtrip() {
        for id in ProviderId::ALL {
            assert_eq!(ProviderId::parse(id.as_str()), Some(id));
        }
        assert_eq!(ProviderId::parse("bedrock"), None);
    }

    #[test]
    fn usage_total_invariant() {
        let mut u = Usage::new(3, 2, 0.5);
        assert_eq!(u.total_tokens, 5);
        u.add(&Usage::new(10, 4, 0.25));
        assert_eq!(u.input_tokens, 13);
        assert_eq!(u.output_tokens, 6);
        assert_eq!(u.total_tokens, 19);
        assert!((u.cost - 0.75).abs() < 1e-9);
    }

    #[test]
    fn temperature_bounds() {
        let mut config = SessionConfig {
            provider: ProviderId::Claude,
            model: "m".into(),
            temperature: 0.0,
            max_tokens: 16,
            system_prompt: String::new(),
            tools: Vec::new(),
        };
        assert!(config.validate().is_ok());
        config.temperature = 2.0;
        assert!(config.validate().is_ok());
        config.temperature = 2.0000001;
        let (field, _) = config.validate().unwrap_err();
        assert_eq!(field, "config.temperature");
    }

    #[test]
    fn message_wire_shape_is_camel_case() {
        let msg = Message::tool_result("t1", "{\"hits\":[\"a\"]}");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["toolCallId"], "t1");
        assert_eq!(json["role"], "tool");
        assert!(json.get("toolCalls").is_none(), "empty toolCalls omitted");
    }

    #[test]
    fn finish_reason_wire_names() {
        assert_eq!(
            serde_json::to_value(FinishReason::ToolCalls).unwrap(),
            "tool_calls"
        );
        assert_eq!(
            serde_json::to_value(FinishReason::Cancelled).unwrap(),
            "cancelled"
        );
    }
}
