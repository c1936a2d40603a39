//! Typed push events
//!
//! The push transport hands over raw `{type, data}` frames. This module is the
//! closed set of event types the coordinator understands; anything else is a
//! no-op, not an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::message::{Citation, MessageError, TokenUsage, ToolCall};

/// A new assistant turn, which is also the server echo of the user message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnStarted {
    pub topic_id: String,
    pub stream_id: String,
    /// Server id for the assistant message; used as its `id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Client id of the user message being echoed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_db_id: Option<String>,
    /// Present when the user message came from another client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_content: Option<String>,
}

/// Addresses one turn of a topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRef {
    pub topic_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    #[serde(flatten)]
    pub turn: TurnRef,
    /// Monotonic per-stream sequence; replays carry the same value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallEvent {
    #[serde(flatten)]
    pub turn: TurnRef,
    pub tool_call: ToolCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnCompleted {
    #[serde(flatten)]
    pub turn: TurnRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_id: Option<String>,
    /// Authoritative final content, replacing the streamed text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnFailed {
    #[serde(flatten)]
    pub turn: TurnRef,
    pub error: MessageError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePersisted {
    #[serde(flatten)]
    pub turn: TurnRef,
    pub db_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicUpdated {
    pub topic_id: String,
    pub title: String,
}

/// Every push event the coordinator acts on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    TurnStarted(TurnStarted),
    Thinking(TurnRef),
    Chunk(Chunk),
    ToolCall(ToolCallEvent),
    TurnCompleted(TurnCompleted),
    TurnFailed(TurnFailed),
    /// Acknowledgement of an abort
    TurnCancelled(TurnRef),
    MessagePersisted(MessagePersisted),
    TopicUpdated(TopicUpdated),
}

impl PushEvent {
    /// Wire names of all known event types
    pub const KINDS: &'static [&'static str] = &[
        "turn_started",
        "thinking",
        "chunk",
        "tool_call",
        "turn_completed",
        "turn_failed",
        "turn_cancelled",
        "message_persisted",
        "topic_updated",
    ];

    /// Decode a frame. Unknown types and malformed payloads yield `None`.
    pub fn from_frame(kind: &str, data: &Value) -> Option<Self> {
        if !Self::KINDS.iter().any(|known| *known == kind) {
            trace!(kind, "Ignoring unknown push event type");
            return None;
        }
        let tagged = serde_json::json!({ "type": kind, "data": data });
        match serde_json::from_value(tagged) {
            Ok(event) => Some(event),
            Err(e) => {
                debug!(kind, error = %e, "Dropping malformed push event");
                None
            }
        }
    }

    /// Topic the event belongs to
    pub fn topic_id(&self) -> &str {
        match self {
            Self::TurnStarted(e) => &e.topic_id,
            Self::Thinking(turn) | Self::TurnCancelled(turn) => &turn.topic_id,
            Self::Chunk(e) => &e.turn.topic_id,
            Self::ToolCall(e) => &e.turn.topic_id,
            Self::TurnCompleted(e) => &e.turn.topic_id,
            Self::TurnFailed(e) => &e.turn.topic_id,
            Self::MessagePersisted(e) => &e.turn.topic_id,
            Self::TopicUpdated(e) => &e.topic_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::TurnStarted(_) => "turn_started",
            Self::Thinking(_) => "thinking",
            Self::Chunk(_) => "chunk",
            Self::ToolCall(_) => "tool_call",
            Self::TurnCompleted(_) => "turn_completed",
            Self::TurnFailed(_) => "turn_failed",
            Self::TurnCancelled(_) => "turn_cancelled",
            Self::MessagePersisted(_) => "message_persisted",
            Self::TopicUpdated(_) => "topic_updated",
        }
    }
}
