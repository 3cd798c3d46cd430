//! JSON wire protocol between canvas clients and the sync server.
//!
//! Every frame is a WebSocket text message of the form:
//! ```text
//! { "event": "<kebab-case name>", "data": { ...camelCase fields... } }
//! ```
//!
//! Inbound fields all default to empty so that a missing field reaches the
//! coordinator and is reported as a validation error naming it, instead of
//! failing the whole frame.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SyncError;
use crate::model::{CanvasObject, ChatMessage, ObjectData, Room};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinRoom {
    pub room_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockRequest {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendMessage {
    pub author: String,
    pub content: String,
}

/// Events a connection sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom(JoinRoom),
    CreateObject(ObjectData),
    UpdateObject(ObjectData),
    DeleteObject(ObjectRef),
    LockObject(LockRequest),
    UnlockObject(LockRequest),
    SendMessage(SendMessage),
}

impl ClientEvent {
    /// Wire name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => "join-room",
            ClientEvent::CreateObject(_) => "create-object",
            ClientEvent::UpdateObject(_) => "update-object",
            ClientEvent::DeleteObject(_) => "delete-object",
            ClientEvent::LockObject(_) => "lock-object",
            ClientEvent::UnlockObject(_) => "unlock-object",
            ClientEvent::SendMessage(_) => "send-message",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Events the server sends to a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Snapshot for a connection that just joined (sent to it only).
    InitialState { room: Room, objects: Vec<CanvasObject> },
    UserJoined { display_name: String },
    ObjectCreated(ObjectData),
    ObjectUpdated(ObjectData),
    ObjectDeleted { id: String },
    ObjectLocked { id: String, display_name: String },
    ObjectUnlocked { id: String, display_name: String },
    NewMessage(ChatMessage),
    UserDisconnected { display_name: String },
    /// A rejected operation, reported to its origin only.
    Error {
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder: Option<String>,
    },
    RateLimitReset { message: String },
    ServerShutdown { message: String },
}

impl ServerEvent {
    pub fn error(err: &SyncError) -> Self {
        ServerEvent::Error {
            kind: err.kind().as_str().to_string(),
            message: err.client_message(),
            holder: err.holder().map(str::to_string),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("malformed event: {0}")]
    DeserializationError(String),
}
