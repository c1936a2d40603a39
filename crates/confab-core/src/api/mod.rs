//! REST collaborator contracts
//!
//! Sessions, topics and message persistence live behind conventional
//! request/response endpoints. The core only depends on this trait; tests and
//! alternative backends substitute their own implementation.

mod http;

pub use http::HttpChatApi;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::ModelSelection;
use crate::error::ApiError;
use crate::message::{Attachment, Citation, Message, MessageError, MessageStatus, Role, ToolCall};

/// A persisted conversation thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub id: String,
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// An agent's session and its topics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    #[serde(default)]
    pub topics: Vec<Topic>,
}

impl Session {
    /// Topic with the latest `updated_at`
    pub fn most_recent_topic(&self) -> Option<&Topic> {
        self.topics.iter().max_by_key(|t| t.updated_at)
    }
}

/// A message as stored server-side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMessage {
    /// Client id the message was created with
    pub id: String,
    pub db_id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_remote_status")]
    pub status: MessageStatus,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub error: Option<MessageError>,
    pub created_at: DateTime<Utc>,
}

fn default_remote_status() -> MessageStatus {
    MessageStatus::Completed
}

impl RemoteMessage {
    /// Local form of a persisted message. History is always terminal.
    pub fn into_message(self) -> Message {
        let status = if self.status.is_terminal() {
            self.status
        } else {
            MessageStatus::Completed
        };
        let mut message = Message::new(self.id, self.role, self.content, status);
        message.db_id = Some(self.db_id);
        message.tool_calls = self.tool_calls;
        message.attachments = self.attachments;
        message.citations = self.citations;
        message.error = self.error;
        message.created_at = self.created_at;
        message
    }
}

/// Result of persisting a user message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    #[serde(default)]
    pub db_id: Option<String>,
}

/// Partial topic update
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Request/response collaborators consumed by the core
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn fetch_session_by_agent(&self, agent_id: &str) -> Result<Session, ApiError>;

    async fn create_topic(&self, session_id: &str, title: Option<&str>) -> Result<Topic, ApiError>;

    async fn fetch_messages(&self, topic_id: &str) -> Result<Vec<RemoteMessage>, ApiError>;

    async fn update_topic(&self, topic_id: &str, patch: &TopicPatch) -> Result<Topic, ApiError>;

    async fn delete_topic(&self, topic_id: &str) -> Result<(), ApiError>;

    async fn send_message(
        &self,
        topic_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<SendReceipt, ApiError>;

    /// Ask the server to cancel the in-flight generation of a topic
    async fn abort_generation(&self, topic_id: &str, stream_id: Option<&str>)
    -> Result<(), ApiError>;

    async fn update_channel_model(
        &self,
        topic_id: &str,
        selection: &ModelSelection,
    ) -> Result<(), ApiError>;
}
