//! Message data model and lifecycle
//!
//! ```text
//!  (local send) ──▶ sending ──echo──▶ completed          (user message)
//!                      │
//!                      └── persist failure ──▶ failed
//!
//!  (turn_started) ──▶ pending ──▶ thinking ──▶ streaming ──▶ completed
//!                        │           │            │    ╰──▶ failed
//!                        ╰───────────┴────────────┴──────▶ cancelled
//! ```
//!
//! Completed, failed and cancelled are terminal. A terminal message keeps its
//! content, status and error forever; only a late `db_id` may still arrive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Client-generated message identifier, stable for the message's lifetime
pub type MessageId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Pending,
    Thinking,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self → to` is a legal lifecycle edge
    pub fn can_transition_to(self, to: MessageStatus) -> bool {
        use MessageStatus::*;
        match (self, to) {
            (Sending, Completed | Failed | Cancelled) => true,
            (Pending, Thinking | Streaming | Completed | Failed | Cancelled) => true,
            (Thinking, Streaming | Completed | Failed | Cancelled) => true,
            (Streaming, Streaming | Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

/// Error category carried on a failed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Upstream model or provider failure
    Provider,
    /// Policy or validation rejection
    Content,
    /// Internal agent logic failure
    Agent,
    /// Quota or entitlement
    Billing,
    /// Transport or infrastructure
    System,
}

/// Structured error surfaced verbatim on a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageError {
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    /// Drives whether a retry affordance is shown
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl MessageError {
    pub fn new(
        code: impl Into<String>,
        category: ErrorCategory,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self {
            code: code.into(),
            category,
            message: message.into(),
            recoverable,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Latest token usage reported for a channel (not cumulative)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    /// Correlation id of the in-flight generation; cleared on terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    /// Durable id; set at most once, never cleared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MessageError>,
    pub created_at: DateTime<Utc>,
    /// Highest chunk sequence applied, for replay detection
    #[serde(skip)]
    last_seq: Option<u64>,
    /// Stream that opened this turn; kept after `stream_id` is cleared
    #[serde(skip)]
    opened_by: Option<String>,
}

/// Illegal lifecycle edge
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal transition {from:?} -> {to:?} for message {id}")]
pub struct TransitionError {
    pub id: MessageId,
    pub from: MessageStatus,
    pub to: MessageStatus,
}

impl Message {
    /// Optimistic user message, before the server has echoed it
    pub fn outgoing(content: impl Into<String>) -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            Role::User,
            content,
            MessageStatus::Sending,
        )
    }

    /// Assistant message opened by a new turn
    pub fn assistant_turn(id: impl Into<MessageId>, stream_id: impl Into<String>) -> Self {
        let stream_id = stream_id.into();
        let mut message = Self::new(id, Role::Assistant, String::new(), MessageStatus::Pending);
        message.stream_id = Some(stream_id.clone());
        message.opened_by = Some(stream_id);
        message
    }

    pub fn new(
        id: impl Into<MessageId>,
        role: Role,
        content: impl Into<String>,
        status: MessageStatus,
    ) -> Self {
        Self {
            id: id.into(),
            stream_id: None,
            db_id: None,
            role,
            content: content.into(),
            status,
            tool_calls: Vec::new(),
            attachments: Vec::new(),
            citations: Vec::new(),
            error: None,
            created_at: Utc::now(),
            last_seq: None,
            opened_by: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether this turn was opened by `stream_id`, live or finished
    pub fn opened_by(&self, stream_id: &str) -> bool {
        self.opened_by.as_deref() == Some(stream_id)
    }

    /// A message is durable once the server has assigned it a `db_id`
    pub fn is_durable(&self) -> bool {
        self.db_id.is_some()
    }

    /// Move along a lifecycle edge. Entering a terminal status clears `stream_id`.
    pub(crate) fn transition(&mut self, to: MessageStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.stream_id = None;
        }
        Ok(())
    }

    /// Terminal failure with a surfaced error
    pub(crate) fn fail(&mut self, error: MessageError) -> Result<(), TransitionError> {
        self.transition(MessageStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// Append a streamed chunk.
    ///
    /// The first chunk moves a pending or thinking message to streaming.
    /// Chunks whose `seq` is not above the last applied one are replays and are
    /// ignored. Returns whether the content changed.
    pub(crate) fn append_chunk(
        &mut self,
        seq: Option<u64>,
        delta: &str,
    ) -> Result<bool, TransitionError> {
        if let (Some(seq), Some(last)) = (seq, self.last_seq) {
            if seq <= last {
                return Ok(false);
            }
        }
        self.transition(MessageStatus::Streaming)?;
        self.content.push_str(delta);
        if seq.is_some() {
            self.last_seq = seq;
        }
        Ok(true)
    }

    /// Record the durable id. Returns `false` if one was already set.
    pub(crate) fn assign_db_id(&mut self, db_id: &str) -> bool {
        if self.db_id.is_some() {
            return false;
        }
        self.db_id = Some(db_id.to_string());
        true
    }
}
