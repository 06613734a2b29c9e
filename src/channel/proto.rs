use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Semantic kind of an envelope exchanged over the session channel.
///
/// The set is closed on the client side but forward-compatible: kinds the
/// server adds later decode as [`EventType::Unknown`] and are ignored by
/// dispatch rather than treated as errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JoinSession,
    LeaveSession,
    SendMessage,
    StartBrainstorm,
    NextRound,
    UserJoined,
    UserLeft,
    NewMessage,
    LlmTyping,
    LlmStoppedTyping,
    ConsensusUpdate,
    RoundUpdate,
    SessionCompleted,
    Error,
    #[serde(other)]
    Unknown,
}

/// Client-to-server wire unit. The server assigns timestamps, so outbound
/// envelopes never carry one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundEnvelope {
    #[serde(rename = "type")]
    pub event: EventType,
    pub data: Value,
}

impl OutboundEnvelope {
    pub fn new(event: EventType, data: Value) -> Self {
        Self { event, data }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Server-to-client wire unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEnvelope {
    #[serde(rename = "type")]
    pub event: EventType,
    #[serde(default)]
    pub data: Value,
    /// ISO-8601 timestamp assigned by the server. Tolerated as absent so a
    /// lagging server build cannot take the channel down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl InboundEnvelope {
    pub fn new(event: EventType, data: Value, timestamp: impl Into<String>) -> Self {
        Self {
            event,
            data,
            timestamp: Some(timestamp.into()),
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Author role attached to a discussion message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// `new_message` payload broadcast when any participant speaks.
///
/// User and system messages carry only the required fields; agent messages
/// add the llm identity and generation metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePayload {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_brand_color: Option<String>,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    pub created_at: String,
}

/// `llm_typing` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingPayload {
    pub llm_id: i64,
    pub llm_name: String,
}

/// `llm_stopped_typing` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingStoppedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_id: Option<i64>,
}

/// `consensus_update` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsensusPayload {
    pub consensus_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_round: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_messages: Option<u64>,
}

/// `round_update` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoundPayload {
    pub current_round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rounds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// `session_completed` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rounds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_messages: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_percentage: Option<f64>,
}

/// `user_joined` / `user_left` payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresencePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub connection_count: u32,
}

/// `error` payload pushed by the server for a failed command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn outbound_envelope_carries_no_timestamp() {
        let envelope = OutboundEnvelope::new(EventType::SendMessage, json!({"content": "hi"}));
        let value = serde_json::to_value(&envelope).expect("serialize");

        assert_eq!(value.get("type").and_then(Value::as_str), Some("send_message"));
        assert_eq!(value["data"], json!({"content": "hi"}));
        assert!(value.get("timestamp").is_none());
    }

    #[test]
    fn inbound_envelope_round_trip() {
        let envelope = InboundEnvelope::new(
            EventType::ConsensusUpdate,
            json!({"consensus_percentage": 62.5}),
            "2025-06-01T12:00:00Z",
        );

        let text = envelope.to_text().expect("encode");
        let decoded = InboundEnvelope::from_text(&text).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn inbound_envelope_tolerates_missing_timestamp() {
        let decoded =
            InboundEnvelope::from_text(r#"{"type":"round_update","data":{"current_round":2}}"#)
                .expect("decode");

        assert_eq!(decoded.event, EventType::RoundUpdate);
        assert_eq!(decoded.timestamp, None);
    }

    #[test]
    fn unrecognized_event_kind_decodes_as_unknown() {
        let decoded = InboundEnvelope::from_text(
            r#"{"type":"sentiment_shift","data":{},"timestamp":"2025-06-01T12:00:00Z"}"#,
        )
        .expect("decode");

        assert_eq!(decoded.event, EventType::Unknown);
    }

    #[test]
    fn agent_message_payload_decodes_from_broadcast_shape() {
        let payload: MessagePayload = serde_json::from_value(json!({
            "id": 17,
            "session_id": 42,
            "llm_id": 3,
            "llm_name": "claude",
            "llm_brand_color": "#d97757",
            "role": "assistant",
            "content": "I agree with the premise.",
            "thinking_content": null,
            "tokens_used": 118,
            "response_time_ms": 2304,
            "created_at": "2025-06-01T12:00:00Z"
        }))
        .expect("decode");

        assert_eq!(payload.role, MessageRole::Assistant);
        assert_eq!(payload.llm_id, Some(3));
        assert_eq!(payload.tokens_used, Some(118));
    }

    #[test]
    fn user_message_payload_decodes_without_llm_fields() {
        let payload: MessagePayload = serde_json::from_value(json!({
            "id": 18,
            "role": "user",
            "content": "what about cost?",
            "created_at": "2025-06-01T12:00:05Z"
        }))
        .expect("decode");

        assert_eq!(payload.role, MessageRole::User);
        assert_eq!(payload.llm_id, None);
        assert_eq!(payload.session_id, None);
    }

    #[test]
    fn completion_payload_decodes_with_partial_fields() {
        let payload: CompletionPayload =
            serde_json::from_value(json!({"summary": "done", "consensus_percentage": 80.0}))
                .expect("decode");

        assert_eq!(payload.summary.as_deref(), Some("done"));
        assert_eq!(payload.total_rounds, None);
    }
}
