//! Wire protocol for the `/ws` endpoint.
//!
//! Every frame is a JSON text frame of the form `{"type": <event>, "payload": <value>}`.
//! Event names are kebab-case; payload field names are camelCase.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::connection_manager::PresenceSnapshot;

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    IdentityAnnounce { user_id: String },
    #[serde(rename_all = "camelCase")]
    MessageSent {
        chat_id: String,
        payload: serde_json::Value,
    },
    Ping,
}

impl ClientMessage {
    /// Event name used for logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IdentityAnnounce { .. } => "identity-announce",
            Self::MessageSent { .. } => "message-sent",
            Self::Ping => "ping",
        }
    }
}

/// A chat message as seen by a recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDelivery {
    pub sender_id: String,
    pub chat_id: String,
    pub payload: serde_json::Value,
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    PresenceUpdate(PresenceSnapshot),
    MessageReceived(MessageDelivery),
    Pong,
    Heartbeat,
    #[serde(rename_all = "camelCase")]
    Shutdown {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reconnect_after_seconds: Option<u64>,
    },
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn shutdown(reason: impl Into<String>, reconnect_after_seconds: Option<u64>) -> Self {
        Self::Shutdown {
            reason: reason.into(),
            reconnect_after_seconds,
        }
    }
}

/// A frame queued for a connection's writer task.
///
/// Fan-out paths serialize once and share the text across all handles.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Raw(ServerMessage),
    Preserialized(Arc<str>),
    /// Serialized presence snapshot; a higher `seq` supersedes a lower one
    Presence { seq: u64, text: Arc<str> },
    /// Heartbeat event, written as a text frame followed by a transport ping
    Heartbeat,
}

impl OutboundFrame {
    pub fn preserialized(message: &ServerMessage) -> Result<Self, serde_json::Error> {
        let text = serde_json::to_string(message)?;
        Ok(Self::Preserialized(Arc::from(text)))
    }

    pub fn presence(seq: u64, text: Arc<str>) -> Self {
        Self::Presence { seq, text }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Raw(message) => serde_json::to_string(message),
            Self::Preserialized(text) | Self::Presence { text, .. } => Ok(text.to_string()),
            Self::Heartbeat => serde_json::to_string(&ServerMessage::Heartbeat),
        }
    }
}
