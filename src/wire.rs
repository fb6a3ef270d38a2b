//! JSON frames exchanged between [`crate::ws_client::WsSource`] and
//! [`crate::server::WsVariableServer`] over WebSocket text messages.

use serde::{Deserialize, Serialize};

use crate::source::{NodeId, QualifiedName, Variant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Browse { id: u64, path: Vec<QualifiedName> },
    Read { id: u64, node: NodeId },
    Write { id: u64, node: NodeId, value: Variant },
}

impl Request {
    pub fn id(&self) -> u64 {
        match self {
            Request::Browse { id, .. } | Request::Read { id, .. } | Request::Write { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Node { id: u64, node: NodeId },
    Value { id: u64, value: Variant },
    Ack { id: u64 },
    Error { id: u64, message: String },
    /// Pushed to every client when a variable changes.
    Changed { node: NodeId, value: Variant },
}

impl ServerMessage {
    /// Request id this message answers, `None` for pushes.
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            ServerMessage::Node { id, .. }
            | ServerMessage::Value { id, .. }
            | ServerMessage::Ack { id }
            | ServerMessage::Error { id, .. } => Some(*id),
            ServerMessage::Changed { .. } => None,
        }
    }
}
