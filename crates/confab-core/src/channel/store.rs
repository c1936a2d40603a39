//! Channel State Store
//!
//! The single writer-of-record for channel and message state. Every mutation
//! goes through a named operation that works on a copy of the channel, checks
//! the channel invariants against the previous state, and only then commits
//! and notifies listeners. A mutation that would break an invariant is
//! dropped whole.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, error};

use super::{Channel, ChannelId, ChannelInit};
use crate::error::{Error, Rejection, Result};
use crate::message::Message;

/// Change notification delivered synchronously after a committed mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    ChannelActivated(ChannelId),
    ChannelUpdated(ChannelId),
    /// Explicit clear-topic; the only change allowed to shrink `messages`
    TopicCleared(ChannelId),
    ChannelRemoved(ChannelId),
}

impl StoreChange {
    pub fn channel_id(&self) -> &str {
        match self {
            Self::ChannelActivated(id)
            | Self::ChannelUpdated(id)
            | Self::TopicCleared(id)
            | Self::ChannelRemoved(id) => id,
        }
    }
}

type Listener = Arc<dyn Fn(&StoreChange) + Send + Sync>;

/// In-memory table of channels
#[derive(Default)]
pub struct ChannelStore {
    channels: RwLock<HashMap<ChannelId, Channel>>,
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one channel
    pub fn get(&self, id: &str) -> Option<Channel> {
        self.channels.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.channels.read().contains_key(id)
    }

    /// Snapshot of a channel's messages (empty if the channel is unknown)
    pub fn messages(&self, id: &str) -> Vec<Message> {
        self.channels
            .read()
            .get(id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.channels.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }

    /// Observe committed mutations. Dropping the subscription unregisters.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> StoreSubscription
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().push((id, Arc::new(listener)));
        StoreSubscription {
            store: Arc::downgrade(self),
            id,
        }
    }

    /// Create the channel if it doesn't exist. Returns whether it was created.
    pub(crate) fn activate(&self, init: ChannelInit) -> bool {
        let id = init.id.clone();
        {
            let mut channels = self.channels.write();
            if channels.contains_key(&id) {
                return false;
            }
            channels.insert(id.clone(), Channel::new(init));
        }
        debug!(channel_id = %id, "Channel activated");
        self.notify(&StoreChange::ChannelActivated(id));
        true
    }

    /// Apply a mutation to one channel.
    ///
    /// The closure works on a copy; if it returns an error or the result
    /// breaks an invariant, nothing is committed. Listeners are notified only
    /// when the channel actually changed.
    pub(crate) fn update<R>(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut Channel) -> Result<R>,
    ) -> Result<R> {
        let (value, changed) = {
            let mut channels = self.channels.write();
            let current = channels
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("channel {id}")))?;

            let mut next = current.clone();
            let value = mutate(&mut next)?;
            if next.aborting && !next.responding() {
                next.aborting = false;
            }

            if next == *current {
                (value, false)
            } else {
                if let Err(reason) = check_invariants(current, &next) {
                    error!(channel_id = %id, %reason, "Rejected channel mutation");
                    return Err(Error::Invariant(reason));
                }
                channels.insert(id.to_string(), next);
                (value, true)
            }
        };

        if changed {
            self.notify(&StoreChange::ChannelUpdated(id.to_string()));
        }
        Ok(value)
    }

    /// Drop every message of a channel. Returns how many were removed.
    ///
    /// Rejected as busy while a message is in flight.
    pub(crate) fn clear_topic(&self, id: &str) -> Result<usize> {
        let removed = {
            let mut channels = self.channels.write();
            let channel = channels
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(format!("channel {id}")))?;
            if channel.responding() {
                return Err(Rejection::Busy.into());
            }
            let removed = channel.messages.len();
            channel.messages.clear();
            channel.aborting = false;
            channel.token_usage = None;
            removed
        };
        debug!(channel_id = %id, removed, "Topic cleared");
        self.notify(&StoreChange::TopicCleared(id.to_string()));
        Ok(removed)
    }

    /// Destroy a channel. Returns whether it existed.
    pub(crate) fn remove(&self, id: &str) -> bool {
        let existed = self.channels.write().remove(id).is_some();
        if existed {
            debug!(channel_id = %id, "Channel removed");
            self.notify(&StoreChange::ChannelRemoved(id.to_string()));
        }
        existed
    }

    fn notify(&self, change: &StoreChange) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(change);
        }
    }
}

/// Compare a proposed channel state against the committed one
fn check_invariants(before: &Channel, after: &Channel) -> std::result::Result<(), String> {
    if after.messages.len() < before.messages.len() {
        return Err(format!(
            "message count would drop from {} to {}",
            before.messages.len(),
            after.messages.len()
        ));
    }

    let mut seen = HashSet::new();
    for id in after.ids() {
        if !seen.insert(id.as_str()) {
            return Err(format!("duplicate message id {id}"));
        }
    }

    let by_id: HashMap<&str, &Message> =
        after.messages.iter().map(|m| (m.id.as_str(), m)).collect();
    for old in &before.messages {
        let Some(new) = by_id.get(old.id.as_str()) else {
            return Err(format!("message {} would be dropped", old.id));
        };
        if old.db_id.is_some() && new.db_id != old.db_id {
            return Err(format!("db_id of message {} would change", old.id));
        }
        if old.is_terminal()
            && (new.status != old.status || new.content != old.content || new.error != old.error)
        {
            return Err(format!("terminal message {} would change", old.id));
        }
    }

    let in_flight = after.messages.iter().filter(|m| !m.is_terminal()).count();
    if in_flight > 1 {
        return Err(format!("{in_flight} messages in flight"));
    }
    if let Some(m) = after
        .messages
        .iter()
        .find(|m| m.is_terminal() && m.stream_id.is_some())
    {
        return Err(format!("terminal message {} still has a stream id", m.id));
    }
    if after.aborting && !after.responding() {
        return Err("aborting without a turn in progress".to_string());
    }
    Ok(())
}

/// Listener registration returned by [`ChannelStore::subscribe`]
#[must_use = "dropping a StoreSubscription unregisters its listener"]
pub struct StoreSubscription {
    store: Weak<ChannelStore>,
    id: u64,
}

impl Drop for StoreSubscription {
    fn drop(&mut self) {
        if let Some(store) = self.store.upgrade() {
            store.listeners.write().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageStatus, Role};
    use parking_lot::Mutex;

    fn store_with_channel() -> Arc<ChannelStore> {
        let store = Arc::new(ChannelStore::new());
        store.activate(ChannelInit::new("t1", "s1"));
        store
    }

    #[test]
    fn test_activate_is_idempotent() {
        let store = ChannelStore::new();
        assert!(store.activate(ChannelInit::new("t1", "s1")));
        assert!(!store.activate(ChannelInit::new("t1", "other")));
        assert_eq!(store.get("t1").unwrap().session_id, "s1");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_update_rejects_message_drop() {
        let store = store_with_channel();
        store
            .update("t1", |c| {
                c.messages.push(Message::new("m1", Role::User, "hi", MessageStatus::Completed));
                Ok(())
            })
            .unwrap();

        let result = store.update("t1", |c| {
            c.messages.clear();
            Ok(())
        });
        assert!(matches!(result, Err(Error::Invariant(_))));
        assert_eq!(store.messages("t1").len(), 1);
    }

    #[test]
    fn test_update_rejects_second_in_flight_message() {
        let store = store_with_channel();
        store
            .update("t1", |c| {
                c.messages.push(Message::outgoing("one"));
                Ok(())
            })
            .unwrap();

        let result = store.update("t1", |c| {
            c.messages.push(Message::outgoing("two"));
            Ok(())
        });
        assert!(matches!(result, Err(Error::Invariant(_))));
        assert_eq!(store.messages("t1").len(), 1);
    }

    #[test]
    fn test_update_rejects_terminal_edit() {
        let store = store_with_channel();
        store
            .update("t1", |c| {
                c.messages
                    .push(Message::new("m1", Role::Assistant, "done", MessageStatus::Completed));
                Ok(())
            })
            .unwrap();

        let result = store.update("t1", |c| {
            c.messages[0].content.push_str(" more");
            Ok(())
        });
        assert!(matches!(result, Err(Error::Invariant(_))));

        // A late db_id is still allowed
        store
            .update("t1", |c| {
                c.messages[0].assign_db_id("db-1");
                Ok(())
            })
            .unwrap();
        assert_eq!(store.messages("t1")[0].db_id.as_deref(), Some("db-1"));
    }

    #[test]
    fn test_aborting_clears_with_last_in_flight_message() {
        let store = store_with_channel();
        store
            .update("t1", |c| {
                c.messages.push(Message::assistant_turn("a1", "s1"));
                c.aborting = true;
                Ok(())
            })
            .unwrap();
        assert!(store.get("t1").unwrap().aborting);

        store
            .update("t1", |c| {
                c.messages[0].transition(MessageStatus::Cancelled)?;
                Ok(())
            })
            .unwrap();
        let channel = store.get("t1").unwrap();
        assert!(!channel.aborting);
        assert!(!channel.responding());
    }

    #[test]
    fn test_failed_closure_commits_nothing() {
        let store = store_with_channel();
        let result: Result<()> = store.update("t1", |c| {
            c.title = Some("changed".to_string());
            Err(Error::NotFound("nope".to_string()))
        });
        assert!(result.is_err());
        assert!(store.get("t1").unwrap().title.is_none());
    }

    #[test]
    fn test_listeners_see_committed_state_synchronously() {
        let store = store_with_channel();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        let reader = Arc::clone(&store);
        let subscription = store.subscribe(move |change| {
            let count = reader.messages(change.channel_id()).len();
            sink.lock().push((change.clone(), count));
        });

        store
            .update("t1", |c| {
                c.messages.push(Message::new("m1", Role::User, "hello", MessageStatus::Completed));
                Ok(())
            })
            .unwrap();
        // No-op mutation: no notification
        store.update("t1", |_| Ok(())).unwrap();
        store.clear_topic("t1").unwrap();

        assert_eq!(
            *observed.lock(),
            vec![
                (StoreChange::ChannelUpdated("t1".to_string()), 1),
                (StoreChange::TopicCleared("t1".to_string()), 0),
            ]
        );

        drop(subscription);
        store.remove("t1");
        assert_eq!(observed.lock().len(), 2);
    }

    #[test]
    fn test_clear_topic_refuses_while_in_flight() {
        let store = store_with_channel();
        store
            .update("t1", |c| {
                c.messages.push(Message::assistant_turn("a1", "s1"));
                Ok(())
            })
            .unwrap();

        let result = store.clear_topic("t1");
        assert!(matches!(result, Err(Error::Rejected(Rejection::Busy))));
        assert_eq!(store.messages("t1").len(), 1);
    }

    #[test]
    fn test_update_unknown_channel() {
        let store = ChannelStore::new();
        let result = store.update("missing", |_| Ok(()));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
