//! Chat Coordinator
//!
//! The only component that mutates channel and message state. It turns user
//! intent (send, abort, clear, model change) and push events into
//! [`ChannelStore`] mutations, one synchronous mutation per step, so every
//! change is visible to store readers as soon as the call returns.
//!
//! Events are matched to messages by `stream_id` while a turn is in flight and
//! by client id or `db_id` afterwards, never by position, so replayed or
//! reordered events across a reconnect are harmless.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use confab_push::{ConnectionState, PushTransport, Subscription};
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ChatApi, RemoteMessage};
use crate::channel::{Channel, ChannelId, ChannelInit, ChannelStore, ModelSelection};
use crate::error::{Error, Rejection, Result};
use crate::events::{
    Chunk, MessagePersisted, PushEvent, ToolCallEvent, TopicUpdated, TurnCompleted, TurnFailed,
    TurnRef, TurnStarted,
};
use crate::message::{ErrorCategory, Message, MessageError, MessageId, MessageStatus, Role};

/// Activates and releases channels on behalf of navigation surfaces
#[async_trait]
pub trait ChannelActivator: Send + Sync {
    /// Make the channel for a topic live. Returns whether it was newly created.
    async fn activate_channel(&self, session_id: &str, topic_id: &str, agent_id: &str)
    -> Result<bool>;

    /// Activation on behalf of a setup the user may still cancel.
    ///
    /// Once `cancel` fires, an implementation must not change a channel that
    /// already existed; a channel it created is released by the caller.
    async fn preactivate_channel(
        &self,
        session_id: &str,
        topic_id: &str,
        agent_id: &str,
        _cancel: &CancellationToken,
    ) -> Result<bool> {
        self.activate_channel(session_id, topic_id, agent_id).await
    }

    /// Undo an activation
    fn release_channel(&self, topic_id: &str);
}

pub struct ChatCoordinator {
    this: Weak<Self>,
    store: Arc<ChannelStore>,
    api: Arc<dyn ChatApi>,
    transport: PushTransport,
    subscriptions: Mutex<Vec<Subscription>>,
    /// Channels whose topic stream is attached; their `connected` flag
    /// follows the transport
    attached: Mutex<HashSet<ChannelId>>,
    connection_watch: Mutex<Option<JoinHandle<()>>>,
}

impl ChatCoordinator {
    pub fn new(
        store: Arc<ChannelStore>,
        api: Arc<dyn ChatApi>,
        transport: PushTransport,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            store,
            api,
            transport,
            subscriptions: Mutex::new(Vec::new()),
            attached: Mutex::new(HashSet::new()),
            connection_watch: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<ChannelStore> {
        &self.store
    }

    pub fn transport(&self) -> &PushTransport {
        &self.transport
    }

    /// Subscribe to every known push event type. Calling it twice is a no-op.
    pub fn attach(self: &Arc<Self>) {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }
        for kind in PushEvent::KINDS {
            let weak: Weak<Self> = Arc::downgrade(self);
            subscriptions.push(self.transport.on(*kind, move |data| {
                let Some(coordinator) = weak.upgrade() else {
                    return;
                };
                if let Some(event) = PushEvent::from_frame(kind, data) {
                    coordinator.apply_event(event);
                }
            }));
        }
        debug!(handlers = subscriptions.len(), "Coordinator attached to push transport");
    }

    /// Drop all push handlers
    pub fn detach(&self) {
        self.subscriptions.lock().clear();
    }

    /// Create a channel for a topic without attaching the push stream
    pub fn open_channel(&self, init: ChannelInit) -> bool {
        self.store.activate(init)
    }

    /// Load history and attach the topic's push stream.
    ///
    /// On failure `connected` stays false and a channel-level error is
    /// recorded; no message is touched. Once attached, `connected` follows
    /// the transport: cleared while it reconnects, set again when it reopens.
    pub async fn connect_to_channel(&self, session_id: &str, channel_id: &str) -> Result<()> {
        self.connect_until(session_id, channel_id, None).await
    }

    /// `connect_to_channel` that stops before touching the channel if
    /// `cancel` fired while history was loading
    async fn connect_until(
        &self,
        session_id: &str,
        channel_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        self.store.activate(ChannelInit::new(channel_id, session_id));

        let fetched = self.api.fetch_messages(channel_id).await;
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            debug!(channel_id, "Channel connect cancelled while loading history");
            return Ok(());
        }
        let history = match fetched {
            Ok(history) => history,
            Err(e) => {
                warn!(channel_id, error = %e, "Failed to load topic history");
                self.record_connection_error(channel_id, e.to_string());
                return Err(e.into());
            }
        };
        self.merge_history(channel_id, history)?;

        self.watch_connection();
        if let Err(e) = self.transport.connect() {
            self.record_connection_error(channel_id, e.to_string());
            return Err(e.into());
        }
        if self.transport.state() == ConnectionState::Closed {
            self.record_connection_error(channel_id, "push connection closed".to_string());
            return Err(Error::Transport(confab_push::PushError::Closed));
        }
        self.transport.announce(
            topic_key(channel_id),
            "subscribe",
            json!({ "sessionId": session_id, "topicId": channel_id }),
        );

        // State changes are applied to attached channels under the same lock
        let mut attached = self.attached.lock();
        attached.insert(channel_id.to_string());
        let live = matches!(
            self.transport.state(),
            ConnectionState::Connecting | ConnectionState::Open
        );
        self.store.update(channel_id, |channel| {
            channel.connected = live;
            channel.connection_error = None;
            Ok(())
        })?;
        drop(attached);
        info!(channel_id, "Channel connected");
        Ok(())
    }

    /// Mirror transport state changes onto attached channels. Started once.
    fn watch_connection(&self) {
        let mut watch = self.connection_watch.lock();
        if watch.is_some() {
            return;
        }
        let mut states = self.transport.watch_state();
        let weak = self.this.clone();
        *watch = Some(tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                coordinator.apply_connection_state(state);
            }
        }));
    }

    fn apply_connection_state(&self, state: ConnectionState) {
        let connected = match state {
            ConnectionState::Open => true,
            ConnectionState::Connecting => return,
            ConnectionState::Idle | ConnectionState::Reconnecting | ConnectionState::Closed => {
                false
            }
        };
        let attached = self.attached.lock();
        for channel_id in attached.iter() {
            let _ = self.store.update(channel_id, |channel| {
                channel.connected = connected;
                Ok(())
            });
        }
        debug!(?state, channels = attached.len(), "Connection state applied to channels");
    }

    fn record_connection_error(&self, channel_id: &str, reason: String) {
        let _ = self.store.update(channel_id, |channel| {
            channel.connected = false;
            channel.connection_error = Some(reason);
            Ok(())
        });
    }

    /// Merge persisted history without ever shrinking the message list.
    ///
    /// Known messages (by `db_id`, then client id) only pick up a missing
    /// `db_id`; unknown ones are inserted before the first local message that
    /// isn't durable yet.
    fn merge_history(&self, channel_id: &str, history: Vec<RemoteMessage>) -> Result<()> {
        self.store.update(channel_id, |channel| {
            let mut insert_at = channel
                .messages
                .iter()
                .position(|m| !m.is_durable())
                .unwrap_or(channel.messages.len());

            for remote in history {
                let known = channel.messages.iter_mut().find(|m| {
                    m.db_id.as_deref() == Some(remote.db_id.as_str()) || m.id == remote.id
                });
                match known {
                    Some(local) => {
                        local.assign_db_id(&remote.db_id);
                    }
                    None => {
                        channel.messages.insert(insert_at, remote.into_message());
                        insert_at += 1;
                    }
                }
            }
            Ok(())
        })
    }

    /// Send a user message.
    ///
    /// Rejected without side effects when the text is blank or the channel is
    /// already responding. Otherwise the message is appended as `sending`
    /// before the network call; if persisting fails it becomes `failed` with a
    /// recoverable error and stays in the list.
    pub async fn send_message(&self, channel_id: &str, text: &str) -> Result<MessageId> {
        if text.trim().is_empty() {
            return Err(Rejection::EmptyMessage.into());
        }

        let message = Message::outgoing(text);
        let message_id = message.id.clone();
        self.store.update(channel_id, |channel| {
            if channel.responding() {
                return Err(Rejection::Busy.into());
            }
            channel.messages.push(message);
            Ok(())
        })?;
        debug!(channel_id, %message_id, "Message queued");

        match self.api.send_message(channel_id, &message_id, text).await {
            Ok(receipt) => {
                if let Some(db_id) = receipt.db_id {
                    self.store.update(channel_id, |channel| {
                        if let Some(message) = channel.message_mut(&message_id) {
                            message.assign_db_id(&db_id);
                        }
                        Ok(())
                    })?;
                }
                Ok(message_id)
            }
            Err(e) => {
                warn!(channel_id, %message_id, error = %e, "Failed to send message");
                let failure =
                    MessageError::new("send_failed", ErrorCategory::System, e.to_string(), true);
                self.store.update(channel_id, |channel| {
                    // The echo may already have confirmed the message
                    if let Some(message) = channel.message_mut(&message_id) {
                        if !message.is_terminal() {
                            message.fail(failure)?;
                        }
                    }
                    Ok(())
                })?;
                Err(e.into())
            }
        }
    }

    /// Ask the server to stop the current turn.
    ///
    /// Returns `Ok(false)` without doing anything unless the channel is
    /// responding and not already aborting. `aborting` is set before the
    /// request goes out and rolled back if the request fails; the turn itself
    /// only ends when the server acknowledges with `turn_cancelled`.
    pub async fn abort_generation(&self, channel_id: &str) -> Result<bool> {
        let target = self.store.update(channel_id, |channel| {
            if !channel.responding() || channel.aborting {
                return Ok(None);
            }
            channel.aborting = true;
            Ok(channel.in_flight().map(|m| m.stream_id.clone()))
        })?;
        let Some(stream_id) = target else {
            return Ok(false);
        };
        info!(channel_id, stream_id = ?stream_id, "Aborting generation");

        if let Err(e) = self.api.abort_generation(channel_id, stream_id.as_deref()).await {
            warn!(channel_id, error = %e, "Abort request failed, turn continues");
            self.store.update(channel_id, |channel| {
                channel.aborting = false;
                Ok(())
            })?;
            return Err(e.into());
        }
        Ok(true)
    }

    /// Explicit clear-topic: the only operation allowed to shrink `messages`.
    /// Rejected as busy while the channel is responding.
    pub fn clear_topic(&self, channel_id: &str) -> Result<usize> {
        self.store.clear_topic(channel_id)
    }

    /// Change provider and model, restoring the previous selection if the
    /// server refuses
    pub async fn set_channel_model(
        &self,
        channel_id: &str,
        selection: ModelSelection,
    ) -> Result<()> {
        let previous = self.store.update(channel_id, |channel| {
            Ok(channel.model.replace(selection.clone()))
        })?;

        if let Err(e) = self.api.update_channel_model(channel_id, &selection).await {
            warn!(channel_id, error = %e, "Model change rejected, restoring previous selection");
            self.store.update(channel_id, |channel| {
                if channel.model.as_ref() == Some(&selection) {
                    channel.model = previous;
                }
                Ok(())
            })?;
            return Err(e.into());
        }
        Ok(())
    }

    /// Snapshot of a channel
    pub fn channel(&self, channel_id: &str) -> Option<Channel> {
        self.store.get(channel_id)
    }

    /// Apply one push event. Events for unknown channels or turns are dropped.
    pub fn apply_event(&self, event: PushEvent) {
        let channel_id: ChannelId = event.topic_id().to_string();
        if !self.store.contains(&channel_id) {
            debug!(
                channel_id = %channel_id,
                kind = event.kind(),
                "Event for inactive channel dropped"
            );
            return;
        }
        let kind = event.kind();
        let result = match event {
            PushEvent::TurnStarted(e) => self.on_turn_started(e),
            PushEvent::Thinking(turn) => self.on_thinking(turn),
            PushEvent::Chunk(e) => self.on_chunk(e),
            PushEvent::ToolCall(e) => self.on_tool_call(e),
            PushEvent::TurnCompleted(e) => self.on_turn_completed(e),
            PushEvent::TurnFailed(e) => self.on_turn_failed(e),
            PushEvent::TurnCancelled(turn) => self.on_turn_cancelled(turn),
            PushEvent::MessagePersisted(e) => self.on_message_persisted(e),
            PushEvent::TopicUpdated(e) => self.on_topic_updated(e),
        };
        if let Err(e) = result {
            warn!(channel_id = %channel_id, kind, error = %e, "Push event not applied");
        }
    }

    fn on_turn_started(&self, event: TurnStarted) -> Result<()> {
        self.store.update(&event.topic_id, |channel| {
            // A stream opens at most one turn, even after that turn finished
            let known_message = event
                .message_id
                .as_deref()
                .is_some_and(|id| channel.message(id).is_some());
            if known_message || channel.has_seen_stream(&event.stream_id) {
                debug!(stream_id = %event.stream_id, "Replayed turn_started ignored");
                return Ok(());
            }
            let assistant_id = event
                .message_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

            if let Some(user_id) = event.user_message_id.as_deref() {
                match channel.message_mut(user_id) {
                    Some(user) => {
                        if let Some(db_id) = event.user_db_id.as_deref() {
                            user.assign_db_id(db_id);
                        }
                        if user.status == MessageStatus::Sending {
                            user.transition(MessageStatus::Completed)?;
                        }
                    }
                    None => {
                        if let Some(content) = event.user_content.as_deref() {
                            let mut user = Message::new(
                                user_id,
                                Role::User,
                                content,
                                MessageStatus::Completed,
                            );
                            user.db_id = event.user_db_id.clone();
                            channel.messages.push(user);
                        }
                    }
                }
            }

            if let Some(stale) = channel.in_flight_mut() {
                if stale.status == MessageStatus::Sending {
                    // Echo without a client id still confirms our pending send
                    stale.transition(MessageStatus::Completed)?;
                    if let Some(db_id) = event.user_db_id.as_deref() {
                        stale.assign_db_id(db_id);
                    }
                } else {
                    // The previous turn's terminal event was lost
                    warn!(message_id = %stale.id, "Superseding turn that never finished");
                    stale.fail(MessageError::new(
                        "turn_superseded",
                        ErrorCategory::System,
                        "A newer turn started before this one finished",
                        false,
                    ))?;
                }
            }

            channel
                .messages
                .push(Message::assistant_turn(assistant_id, event.stream_id.clone()));
            Ok(())
        })
    }

    fn on_thinking(&self, turn: TurnRef) -> Result<()> {
        self.store.update(&turn.topic_id, |channel| {
            let Some(message) =
                channel.find_turn_mut(turn.stream_id.as_deref(), turn.message_id.as_deref(), None)
            else {
                return Ok(());
            };
            if message.status == MessageStatus::Pending {
                message.transition(MessageStatus::Thinking)?;
            }
            Ok(())
        })
    }

    fn on_chunk(&self, chunk: Chunk) -> Result<()> {
        self.store.update(&chunk.turn.topic_id, |channel| {
            let Some(message) = channel.find_turn_mut(
                chunk.turn.stream_id.as_deref(),
                chunk.turn.message_id.as_deref(),
                None,
            ) else {
                debug!(stream_id = ?chunk.turn.stream_id, "Chunk for unknown turn dropped");
                return Ok(());
            };
            if message.is_terminal() {
                return Ok(());
            }
            message.append_chunk(chunk.seq, &chunk.delta)?;
            Ok(())
        })
    }

    fn on_tool_call(&self, event: ToolCallEvent) -> Result<()> {
        self.store.update(&event.turn.topic_id, |channel| {
            let Some(message) = channel.find_turn_mut(
                event.turn.stream_id.as_deref(),
                event.turn.message_id.as_deref(),
                None,
            ) else {
                return Ok(());
            };
            let known = message.tool_calls.iter().any(|c| c.id == event.tool_call.id);
            if message.is_terminal() || known {
                return Ok(());
            }
            message.tool_calls.push(event.tool_call);
            Ok(())
        })
    }

    fn on_turn_completed(&self, event: TurnCompleted) -> Result<()> {
        self.store.update(&event.turn.topic_id, |channel| {
            if let Some(usage) = event.token_usage {
                channel.token_usage = Some(usage);
            }
            let Some(message) = channel.find_turn_mut(
                event.turn.stream_id.as_deref(),
                event.turn.message_id.as_deref(),
                event.db_id.as_deref(),
            ) else {
                debug!(stream_id = ?event.turn.stream_id, "Completion for unknown turn dropped");
                return Ok(());
            };
            if !message.is_terminal() {
                if let Some(content) = event.content {
                    message.content = content;
                }
                if !event.citations.is_empty() {
                    message.citations = event.citations;
                }
                message.transition(MessageStatus::Completed)?;
            }
            if let Some(db_id) = event.db_id.as_deref() {
                message.assign_db_id(db_id);
            }
            Ok(())
        })
    }

    fn on_turn_failed(&self, event: TurnFailed) -> Result<()> {
        self.store.update(&event.turn.topic_id, |channel| {
            let Some(message) = channel.find_turn_mut(
                event.turn.stream_id.as_deref(),
                event.turn.message_id.as_deref(),
                None,
            ) else {
                return Ok(());
            };
            if !message.is_terminal() {
                message.fail(event.error)?;
            }
            Ok(())
        })
    }

    fn on_turn_cancelled(&self, turn: TurnRef) -> Result<()> {
        self.store.update(&turn.topic_id, |channel| {
            let Some(message) =
                channel.find_turn_mut(turn.stream_id.as_deref(), turn.message_id.as_deref(), None)
            else {
                return Ok(());
            };
            if !message.is_terminal() {
                message.transition(MessageStatus::Cancelled)?;
            }
            Ok(())
        })
    }

    fn on_message_persisted(&self, event: MessagePersisted) -> Result<()> {
        self.store.update(&event.turn.topic_id, |channel| {
            if let Some(message) = channel.find_turn_mut(
                event.turn.stream_id.as_deref(),
                event.turn.message_id.as_deref(),
                None,
            ) {
                message.assign_db_id(&event.db_id);
            }
            Ok(())
        })
    }

    fn on_topic_updated(&self, event: TopicUpdated) -> Result<()> {
        self.store.update(&event.topic_id, |channel| {
            channel.title = Some(event.title);
            Ok(())
        })
    }
}

#[async_trait]
impl ChannelActivator for ChatCoordinator {
    async fn activate_channel(
        &self,
        session_id: &str,
        topic_id: &str,
        agent_id: &str,
    ) -> Result<bool> {
        Ok(self.activate(session_id, topic_id, agent_id, None).await)
    }

    async fn preactivate_channel(
        &self,
        session_id: &str,
        topic_id: &str,
        agent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        Ok(self.activate(session_id, topic_id, agent_id, Some(cancel)).await)
    }

    fn release_channel(&self, topic_id: &str) {
        self.attached.lock().remove(topic_id);
        self.transport.withdraw(&topic_key(topic_id));
        self.store.remove(topic_id);
    }
}

impl ChatCoordinator {
    async fn activate(
        &self,
        session_id: &str,
        topic_id: &str,
        agent_id: &str,
        cancel: Option<&CancellationToken>,
    ) -> bool {
        let created = self
            .store
            .activate(ChannelInit::new(topic_id, session_id).with_agent(agent_id));
        // Connection failures are recorded on the channel, not raised here
        if let Err(e) = self.connect_until(session_id, topic_id, cancel).await {
            debug!(topic_id, error = %e, "Channel activated without a live connection");
        }
        created
    }
}

impl Drop for ChatCoordinator {
    fn drop(&mut self) {
        if let Some(watch) = self.connection_watch.get_mut().take() {
            watch.abort();
        }
    }
}

fn topic_key(topic_id: &str) -> String {
    format!("topic:{topic_id}")
}
