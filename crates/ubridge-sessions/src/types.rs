use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ubridge_core::types::{Message, SessionConfig, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    Web,
    Mobile,
    Desktop,
    Server,
    McpServer,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub tools: bool,
    #[serde(default)]
    pub vision: bool,
}

/// A registered client device. Lives until idle past the device TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    pub capabilities: Capabilities,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

/// A conversation session: fixed config plus an append-only message log.
///
/// Existing messages are never rewritten; the only mutations are appends,
/// usage accumulation, and the active→ended transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// UUIDv7-derived, time-sortable, `ses_` prefixed.
    pub id: String,
    pub device_id: String,
    pub config: SessionConfig,
    pub messages: Vec<Message>,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub status: SessionStatus,
}

impl Session {
    pub fn is_ended(&self) -> bool {
        self.status == SessionStatus::Ended
    }

    /// Append one message, folding its token count into the running usage.
    /// Callers have already checked the session is active.
    pub fn push_message(&mut self, msg: Message) {
        if let Some(tokens) = msg.tokens {
            // Assistant output counts as output tokens; everything else is input.
            let usage = match msg.role {
                ubridge_core::types::Role::Assistant => Usage::new(0, tokens, 0.0),
                _ => Usage::new(tokens, 0, 0.0),
            };
            self.usage.add(&usage);
        }
        self.messages.push(msg);
        self.last_activity_at = Utc::now();
    }

    /// Fold a completed turn's provider-reported usage into the session.
    pub fn add_usage(&mut self, usage: &Usage) {
        self.usage.add(usage);
        self.last_activity_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubridge_core::types::{ProviderId, Role};

    fn session() -> Session {
        Session {
            id: "ses_test".into(),
            device_id: "dev_test".into(),
            config: SessionConfig {
                provider: ProviderId::Claude,
                model: "m".into(),
                temperature: 0.0,
                max_tokens: 16,
                system_prompt: String::new(),
                tools: Vec::new(),
            },
            messages: Vec::new(),
            usage: Usage::default(),
            created_at: Utc::now(),
            last_activity_at: Utc::now(),
            status: SessionStatus::Active,
        }
    }

    #[test]
    fn push_message_accumulates_usage_by_role() {
        let mut s = session();
        s.push_message(Message::user("hi").with_tokens(3));
        s.push_message(Message::assistant("hello").with_tokens(2));
        assert_eq!(s.usage.input_tokens, 3);
        assert_eq!(s.usage.output_tokens, 2);
        assert_eq!(s.usage.total_tokens, 5);
        assert_eq!(s.messages.len(), 2);
        assert_eq!(s.messages[1].role, Role::Assistant);
    }

    #[test]
    fn device_type_wire_names() {
        assert_eq!(
            serde_json::to_value(DeviceType::McpServer).unwrap(),
            "mcp-server"
        );
    }
}
