use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Control messages sent from the client to the stream service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { stream: String },
    Unsubscribe { stream: String },
    Ping { client_time_ms: u64 },
}

/// Event pushed by the stream service.
///
/// `stream` is absent for session-wide events such as sync status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerMessage {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl ClientMessage {
    pub fn subscribe(stream: impl Into<String>) -> Self {
        Self::Subscribe {
            stream: stream.into(),
        }
    }

    pub fn unsubscribe(stream: impl Into<String>) -> Self {
        Self::Unsubscribe {
            stream: stream.into(),
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    pub fn new(event: impl Into<String>, stream: Option<&str>, data: Value) -> Self {
        Self {
            event: event.into(),
            stream: stream.map(str::to_string),
            data,
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn subscribe_uses_tagged_wire_shape() {
        let encoded = ClientMessage::subscribe("BTCUSDT").to_text().expect("encode");
        assert_eq!(encoded, r#"{"type":"subscribe","stream":"BTCUSDT"}"#);

        let decoded =
            ClientMessage::from_text(r#"{"type":"unsubscribe","stream":"ETHUSDT"}"#).expect("decode");
        assert_eq!(decoded, ClientMessage::unsubscribe("ETHUSDT"));
    }

    #[test]
    fn server_event_with_stream_key() {
        let decoded = ServerMessage::from_text(
            r#"{"event":"ticker","stream":"BTCUSDT","data":{"price":"64000.10"}}"#,
        )
        .expect("decode");
        assert_eq!(decoded.event, "ticker");
        assert_eq!(decoded.stream.as_deref(), Some("BTCUSDT"));
        assert_eq!(decoded.data, json!({"price": "64000.10"}));
    }

    #[test]
    fn server_event_without_stream_or_data() {
        let decoded = ServerMessage::from_text(r#"{"event":"sync_status"}"#).expect("decode");
        assert_eq!(decoded.stream, None);
        assert_eq!(decoded.data, serde_json::Value::Null);

        let encoded = decoded.to_text().expect("encode");
        assert_eq!(encoded, r#"{"event":"sync_status","data":null}"#);
    }

    #[test]
    fn unknown_client_message_type_is_rejected() {
        assert!(ClientMessage::from_text(r#"{"type":"configure"}"#).is_err());
    }
}
