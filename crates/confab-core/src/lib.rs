//! Confab Core - real-time channel synchronization for agent conversations
//!
//! This crate keeps client-side conversation state consistent with a backend
//! that streams agent responses over a push connection:
//! - Message lifecycle and the channel state store
//! - The chat coordinator, the only writer of channel state
//! - Per-agent open tabs and their local persistence
//! - Race guards for cancellable optimistic setup
//! - REST collaborator contracts, configuration and logging

pub mod api;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod message;
pub mod race_guard;
pub mod tabs;
pub mod telemetry;

pub use api::{ChatApi, HttpChatApi, RemoteMessage, SendReceipt, Session, Topic, TopicPatch};
pub use channel::{
    Channel, ChannelId, ChannelInit, ChannelStore, ModelSelection, StoreChange, StoreSubscription,
};
pub use config::{BackendConfig, Config, ConfigManager, GeneralConfig, TabsConfig, TransportConfig};
pub use coordinator::{ChannelActivator, ChatCoordinator};
pub use error::{ApiError, Error, Rejection, Result};
pub use events::PushEvent;
pub use message::{
    Attachment, Citation, ErrorCategory, Message, MessageError, MessageId, MessageStatus, Role,
    TokenUsage, ToolCall,
};
pub use race_guard::{CancelOutcome, OverlayPreactivation, PendingTicket, RaceGuard, Settlement};
pub use tabs::{FileTabStorage, MemoryTabStorage, OpenTab, StoredTabs, TabReconciler, TabStorage};

// Push transport re-exports
pub use confab_push::{ConnectionState, PushTransport, StaticCredentials, TransportOptions};
