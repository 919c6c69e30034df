//! Realtime and REST message definitions shared by sources and servers.
//!
//! All realtime messages are JSON-encoded, tagged by `type`, and use
//! snake_case field names.

use crate::{error::Result, ChangeEvent, CollectionName, Error, EventKind, Filter, Record, Sequence};
use serde::{Deserialize, Serialize};

/// Identifier assigned by the server to a realtime subscription.
pub type SubscriptionId = String;

/// Messages sent from client to server over the realtime socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a change feed for a collection.
    Subscribe {
        /// Correlates the `subscribed` reply
        request_id: String,
        collection: CollectionName,
        /// Optional server-side scoping
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<Filter>,
        /// Event kinds to deliver (empty means all)
        #[serde(default)]
        kinds: Vec<EventKind>,
    },

    /// Close a change feed.
    Unsubscribe { subscription_id: SubscriptionId },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client over the realtime socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A subscribe request was accepted.
    Subscribed {
        request_id: String,
        subscription_id: SubscriptionId,
    },

    /// A change for an open subscription.
    Change {
        subscription_id: SubscriptionId,
        event: ChangeEvent,
    },

    /// A subscription was closed.
    Unsubscribed { subscription_id: SubscriptionId },

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        message: String,
        /// Request ID from the original request (if applicable)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }

    /// Wrap a change for delivery on a subscription.
    pub fn change(subscription_id: impl Into<SubscriptionId>, event: ChangeEvent) -> Self {
        ServerMessage::Change {
            subscription_id: subscription_id.into(),
            event,
        }
    }
}

/// Body of a collection query response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub records: Vec<Record>,
    /// Latest change sequence at the time of the query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Sequence>,
}

/// Decode a JSON text frame.
pub fn decode<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| Error::MalformedMessage(e.to_string()))
}

/// Encode a message as a JSON text frame.
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    serde_json::to_string(message).map_err(|e| Error::MalformedMessage(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_deserialization() {
        let json = r#"{
            "type": "subscribe",
            "request_id": "req-1",
            "collection": "projects",
            "filter": {"field": "client_id", "value": "X"},
            "kinds": ["created", "updated", "deleted"]
        }"#;
        let msg: ClientMessage = decode(json).unwrap();
        match msg {
            ClientMessage::Subscribe {
                request_id,
                collection,
                filter,
                kinds,
            } => {
                assert_eq!(request_id, "req-1");
                assert_eq!(collection, "projects");
                assert_eq!(filter, Some(Filter::eq("client_id", "X").unwrap()));
                assert_eq!(kinds, EventKind::ALL.to_vec());
            }
            _ => panic!("Expected Subscribe message"),
        }

        let msg: ClientMessage = decode(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_server_message_serialization() {
        let json = encode(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);

        let msg = ServerMessage::error("unknown collection", Some("req-1".to_string()));
        let json = encode(&msg).unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(json.contains(r#""message":"unknown collection""#));
        assert!(json.contains(r#""request_id":"req-1""#));
    }

    #[test]
    fn test_change_message() {
        let record = Record::new("1", json!({"title": "Education"})).unwrap();
        let msg = ServerMessage::change("sub-1", ChangeEvent::created("projects", record));

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "change");
        assert_eq!(value["subscription_id"], "sub-1");
        assert_eq!(value["event"]["change"]["kind"], "created");

        let back: ServerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_malformed_message() {
        let err = decode::<ClientMessage>(r#"{"type": "shout"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
    }
}
