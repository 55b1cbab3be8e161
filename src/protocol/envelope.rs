//! Message envelopes routed between agents.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::Priority;

/// The unit of routed communication.
///
/// `source` and `target` are addressing metadata for handlers; the router
/// itself only looks at `message_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Semantic kind, e.g. `USER_COMMUNICATION`
    #[serde(rename = "type")]
    pub message_type: String,
    /// Sending agent ID
    #[serde(default)]
    pub source: String,
    /// Receiving agent ID ("" for broadcast-by-type)
    #[serde(default)]
    pub target: String,
    /// Payload, meaning defined by the type
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
    /// Creation timestamp (unix ms)
    #[serde(default = "current_timestamp")]
    pub timestamp: i64,
    /// Links a request to its eventual response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// Create a broadcast envelope with medium priority.
    pub fn new(message_type: impl Into<String>, source: impl Into<String>, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            source: source.into(),
            target: String::new(),
            payload,
            priority: Priority::default(),
            timestamp: current_timestamp(),
            correlation_id: None,
        }
    }

    /// Address to a specific agent.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set correlation ID for request/response tracking.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Build a follow-up addressed back to this envelope's sender, keeping
    /// the correlation ID and priority.
    pub fn reply(
        &self,
        message_type: impl Into<String>,
        source: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            source: source.into(),
            target: self.source.clone(),
            payload,
            priority: self.priority,
            timestamp: current_timestamp(),
            correlation_id: self.correlation_id.clone(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.target.is_empty()
    }

    /// Check if this envelope is addressed to a specific agent.
    pub fn is_for(&self, agent_id: &str) -> bool {
        self.target == agent_id
    }

    /// Read a string field from an object payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

pub(crate) fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_creation() {
        let envelope = Envelope::new("CODE_EXTRACTED", "extractor", json!({"lines": 3}));

        assert_eq!(envelope.message_type, "CODE_EXTRACTED");
        assert_eq!(envelope.source, "extractor");
        assert!(envelope.is_broadcast());
        assert_eq!(envelope.priority, Priority::Medium);
        assert!(envelope.correlation_id.is_none());
        assert!(envelope.timestamp > 0);
    }

    #[test]
    fn test_reply_keeps_correlation() {
        let request = Envelope::new("QUESTION", "assistant", json!({}))
            .with_target("coder")
            .with_priority(Priority::High)
            .with_correlation_id("req-1");
        let response = request.reply("ANSWER", "coder", json!({"ok": true}));

        assert_eq!(response.correlation_id.as_deref(), Some("req-1"));
        assert_eq!(response.target, "assistant");
        assert!(response.is_for("assistant"));
        assert_eq!(response.source, "coder");
        assert_eq!(response.priority, Priority::High);
    }

    #[test]
    fn test_wire_shape() {
        let envelope = Envelope::new("USER_COMMUNICATION", "ingest", json!({"text": "hi"}))
            .with_correlation_id("c-9");
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], "USER_COMMUNICATION");
        assert_eq!(value["priority"], 3);
        assert_eq!(value["correlationId"], "c-9");
        assert_eq!(value["target"], "");
    }

    #[test]
    fn test_missing_fields_default() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"type": "PING", "priority": 42}"#).unwrap();

        assert_eq!(envelope.priority, Priority::Medium);
        assert_eq!(envelope.source, "");
        assert!(envelope.payload.is_null());
        assert!(envelope.correlation_id.is_none());
    }
}
