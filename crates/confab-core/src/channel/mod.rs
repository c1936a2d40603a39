//! Channels - the in-memory runtime form of a topic
//!
//! A channel holds the ordered message list of one topic plus its scalar
//! status flags. Channels live in the [`ChannelStore`], which is the only
//! place they are mutated.

mod store;

pub use store::{ChannelStore, StoreChange, StoreSubscription};

use serde::{Deserialize, Serialize};

use crate::message::{Message, MessageId, Role, TokenUsage};

/// Channel identifier (equal to the topic id)
pub type ChannelId = String;

/// Provider and model chosen for a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    pub provider: String,
    pub model: String,
}

impl ModelSelection {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Parameters for activating a channel
#[derive(Debug, Clone, Default)]
pub struct ChannelInit {
    pub id: ChannelId,
    pub session_id: String,
    pub agent_id: Option<String>,
    pub title: Option<String>,
}

impl ChannelInit {
    pub fn new(id: impl Into<ChannelId>, session_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Longest derived title, in characters
const DERIVED_TITLE_CHARS: usize = 40;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelSelection>,
    /// The push stream for this topic is attached
    pub connected: bool,
    /// A cancel request was sent and not yet acknowledged
    pub aborting: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    /// Channel-level connection failure, distinct from message errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_error: Option<String>,
}

impl Channel {
    pub fn new(init: ChannelInit) -> Self {
        Self {
            id: init.id,
            session_id: init.session_id,
            agent_id: init.agent_id,
            title: init.title,
            messages: Vec::new(),
            model: None,
            connected: false,
            aborting: false,
            token_usage: None,
            connection_error: None,
        }
    }

    /// An assistant turn (or an unconfirmed send) is in progress
    pub fn responding(&self) -> bool {
        self.in_flight().is_some()
    }

    /// The single message in a non-terminal status, if any
    pub fn in_flight(&self) -> Option<&Message> {
        self.messages.iter().find(|m| !m.is_terminal())
    }

    pub(crate) fn in_flight_mut(&mut self) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| !m.is_terminal())
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub(crate) fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Whether a turn was ever opened by `stream_id` on this channel
    pub fn has_seen_stream(&self, stream_id: &str) -> bool {
        self.messages
            .iter()
            .any(|m| m.stream_id.as_deref() == Some(stream_id) || m.opened_by(stream_id))
    }

    /// Locate the message an event refers to: by `stream_id` while in flight,
    /// otherwise by client id, otherwise by the stream that opened a finished
    /// turn, otherwise by durable id. Never by position.
    pub(crate) fn find_turn_mut(
        &mut self,
        stream_id: Option<&str>,
        message_id: Option<&str>,
        db_id: Option<&str>,
    ) -> Option<&mut Message> {
        let index = self.find_turn_index(stream_id, message_id, db_id)?;
        self.messages.get_mut(index)
    }

    fn find_turn_index(
        &self,
        stream_id: Option<&str>,
        message_id: Option<&str>,
        db_id: Option<&str>,
    ) -> Option<usize> {
        if let Some(stream_id) = stream_id {
            if let Some(index) = self
                .messages
                .iter()
                .position(|m| m.stream_id.as_deref() == Some(stream_id))
            {
                return Some(index);
            }
        }
        if let Some(message_id) = message_id {
            if let Some(index) = self.messages.iter().position(|m| m.id == message_id) {
                return Some(index);
            }
        }
        if let Some(stream_id) = stream_id {
            if let Some(index) = self.messages.iter().position(|m| m.opened_by(stream_id)) {
                return Some(index);
            }
        }
        let db_id = db_id?;
        self.messages
            .iter()
            .position(|m| m.db_id.as_deref() == Some(db_id))
    }

    /// Display title: explicit title, else the start of the first user message
    pub fn derived_title(&self) -> Option<String> {
        if let Some(title) = self.title.as_ref().filter(|t| !t.trim().is_empty()) {
            return Some(title.clone());
        }
        let first = self
            .messages
            .iter()
            .find(|m| m.role == Role::User && !m.content.trim().is_empty())?;
        let text = first.content.trim();
        let mut title: String = text.chars().take(DERIVED_TITLE_CHARS).collect();
        if text.chars().count() > DERIVED_TITLE_CHARS {
            title.push('…');
        }
        Some(title)
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = &MessageId> {
        self.messages.iter().map(|m| &m.id)
    }
}
