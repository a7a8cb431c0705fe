use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    Active,
    Ended,
}

/// A bucket for externally produced events streamed in over WebSocket or the
/// REST facade. Unrelated to chat sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSession {
    pub id: String,
    pub title: String,
    pub platform: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: CaptureStatus,
    pub event_count: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One captured event. `data` is opaque; the server attaches `timestamp`
/// when the client didn't.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureEvent {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub platform: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// Client → server WebSocket frames, discriminated by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum InboundFrame {
    Register {
        client_type: String,
        #[serde(default)]
        version: Option<String>,
    },
    CreateSession {
        session_id: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        platform: Option<String>,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    EventData {
        session_id: String,
        events: Vec<serde_json::Value>,
    },
    EndSession {
        session_id: String,
    },
}

/// Server → client WebSocket frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        event_count: Option<u64>,
    },
    Error {
        message: String,
    },
}

/// Topics a capture handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    SessionCreated,
    EventReceived,
    SessionEnded,
    SessionFlushed,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::SessionCreated => "session:created",
            Topic::EventReceived => "event:received",
            Topic::SessionEnded => "session:ended",
            Topic::SessionFlushed => "session:flushed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session:created" => Some(Topic::SessionCreated),
            "event:received" => Some(Topic::EventReceived),
            "session:ended" => Some(Topic::SessionEnded),
            "session:flushed" => Some(Topic::SessionFlushed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_frames_parse_by_type() {
        let frame: InboundFrame = serde_json::from_str(
            r#"{"type":"CREATE_SESSION","sessionId":"C","title":"T","platform":"ext"}"#,
        )
        .unwrap();
        assert!(matches!(
            frame,
            InboundFrame::CreateSession { ref session_id, .. } if session_id == "C"
        ));

        let frame: InboundFrame = serde_json::from_str(
            r#"{"type":"EVENT_DATA","sessionId":"C","events":[{"a":1},{"a":2}]}"#,
        )
        .unwrap();
        assert!(matches!(
            frame,
            InboundFrame::EventData { ref events, .. } if events.len() == 2
        ));
    }

    #[test]
    fn unknown_frame_type_fails() {
        assert!(serde_json::from_str::<InboundFrame>(r#"{"type":"NOPE"}"#).is_err());
    }

    #[test]
    fn ack_frame_wire_shape() {
        let ack = OutboundFrame::Ack {
            session_id: Some("C".into()),
            event_count: Some(2),
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["type"], "ACK");
        assert_eq!(json["sessionId"], "C");
        assert_eq!(json["eventCount"], 2);
    }

    #[test]
    fn topic_names_roundtrip() {
        for topic in [
            Topic::SessionCreated,
            Topic::EventReceived,
            Topic::SessionEnded,
            Topic::SessionFlushed,
        ] {
            assert_eq!(Topic::parse(topic.as_str()), Some(topic));
        }
    }
}
