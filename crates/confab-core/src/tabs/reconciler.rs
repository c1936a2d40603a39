//! Tab Reconciler
//!
//! Keeps each agent's open-tab list useful without ever being destructive:
//! tabs are seeded, renamed in one batch, appended and closed, but a failed
//! fetch or an unknown topic never removes a tab.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::storage::{OpenTab, StoredTabs, TabStorage};
use crate::api::{ChatApi, Topic, TopicPatch};
use crate::channel::{ChannelStore, StoreChange, StoreSubscription};
use crate::coordinator::ChannelActivator;
use crate::error::{Error, Result};

/// Everything known about one agent's tabs
#[derive(Debug, Clone, Default)]
struct AgentTabs {
    session_id: Option<String>,
    /// Authoritative topics, most recent first
    topics: Vec<Topic>,
    stored: StoredTabs,
}

impl AgentTabs {
    fn topic(&self, topic_id: &str) -> Option<&Topic> {
        self.topics.iter().find(|t| t.id == topic_id)
    }

    fn tab_index(&self, topic_id: &str) -> Option<usize> {
        self.stored.tabs.iter().position(|t| t.id == topic_id)
    }
}

pub struct TabReconciler {
    api: Arc<dyn ChatApi>,
    activator: Arc<dyn ChannelActivator>,
    storage: Arc<dyn TabStorage>,
    store: Arc<ChannelStore>,
    placeholder: String,
    agents: Mutex<HashMap<String, AgentTabs>>,
}

impl TabReconciler {
    pub fn new(
        api: Arc<dyn ChatApi>,
        activator: Arc<dyn ChannelActivator>,
        storage: Arc<dyn TabStorage>,
        store: Arc<ChannelStore>,
        placeholder: impl Into<String>,
    ) -> Self {
        Self {
            api,
            activator,
            storage,
            store,
            placeholder: placeholder.into(),
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Open tabs of an agent, in display order
    pub fn tabs(&self, agent_id: &str) -> Vec<OpenTab> {
        self.agents
            .lock()
            .get(agent_id)
            .map(|a| a.stored.tabs.clone())
            .unwrap_or_default()
    }

    pub fn active_tab(&self, agent_id: &str) -> Option<String> {
        self.agents
            .lock()
            .get(agent_id)
            .and_then(|a| a.stored.active.clone())
    }

    /// Cached authoritative topics, most recent first
    pub fn topics(&self, agent_id: &str) -> Vec<Topic> {
        self.agents
            .lock()
            .get(agent_id)
            .map(|a| a.topics.clone())
            .unwrap_or_default()
    }

    /// Activate an agent's tab view.
    ///
    /// With no tabs, seeds exactly one from the most recently updated topic.
    /// With tabs, fixes stale names in a single write; ids and order are
    /// never touched. If the session can't be fetched the cached tabs are
    /// kept as they are and the error is returned.
    pub async fn activate_agent(&self, agent_id: &str) -> Result<Vec<OpenTab>> {
        let cached = self.agents.lock().get(agent_id).map(|a| a.stored.clone());
        let stored = match cached {
            Some(stored) => stored,
            None => self.storage.load(agent_id)?.unwrap_or_default(),
        };

        let session = match self.api.fetch_session_by_agent(agent_id).await {
            Ok(session) => session,
            Err(e) => {
                warn!(agent_id, error = %e, "Failed to fetch topics, keeping cached tabs");
                self.agents
                    .lock()
                    .entry(agent_id.to_string())
                    .or_insert_with(|| AgentTabs {
                        stored,
                        ..Default::default()
                    });
                return Err(e.into());
            }
        };

        let mut topics = session.topics.clone();
        topics.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let (next, activate) = {
            let mut agents = self.agents.lock();
            let entry = agents
                .entry(agent_id.to_string())
                .or_insert_with(|| AgentTabs {
                    stored,
                    ..Default::default()
                });
            entry.session_id = Some(session.id.clone());
            entry.topics = topics;

            let mut next = entry.stored.clone();
            if next.tabs.is_empty() {
                if let Some(topic) = session.most_recent_topic() {
                    let name = self.resolve_name(Some(topic), &topic.id);
                    info!(agent_id, topic_id = %topic.id, "Seeding first tab");
                    next.tabs.push(OpenTab::new(topic.id.clone(), name));
                    next.active = Some(topic.id.clone());
                }
            } else {
                for tab in &mut next.tabs {
                    let authoritative = entry
                        .topic(&tab.id)
                        .and_then(|t| t.title.as_deref())
                        .filter(|title| !title.trim().is_empty());
                    if let Some(title) = authoritative {
                        if tab.name != title {
                            debug!(agent_id, topic_id = %tab.id, "Renaming stale tab");
                            tab.name = title.to_string();
                        }
                    }
                }
            }
            let active_open = next
                .active
                .as_ref()
                .is_some_and(|id| next.tabs.iter().any(|t| &t.id == id));
            if !active_open {
                next.active = next.tabs.first().map(|t| t.id.clone());
            }

            let changed = next != entry.stored;
            let active = next.active.clone();
            entry.stored = next.clone();
            (changed.then_some(next), active)
        };

        if let Some(next) = &next {
            self.storage.save(agent_id, next)?;
        }
        if let Some(topic_id) = activate {
            self.activator
                .activate_channel(&session.id, &topic_id, agent_id)
                .await?;
        }
        Ok(self.tabs(agent_id))
    }

    /// Make sure the externally chosen topic has a tab and is active
    pub async fn sync_active_topic(&self, agent_id: &str, topic_id: &str) -> Result<()> {
        let (session_id, next) = {
            let mut agents = self.agents.lock();
            let entry = agents
                .get_mut(agent_id)
                .ok_or_else(|| Error::NotFound(format!("agent {agent_id}")))?;
            let mut next = entry.stored.clone();
            if entry.tab_index(topic_id).is_none() {
                let name = self.resolve_name(entry.topic(topic_id), topic_id);
                next.tabs.push(OpenTab::new(topic_id, name));
            }
            next.active = Some(topic_id.to_string());
            let changed = next != entry.stored;
            entry.stored = next.clone();
            (entry.session_id.clone(), changed.then_some(next))
        };

        if let Some(next) = &next {
            self.storage.save(agent_id, next)?;
        }
        if let Some(session_id) = session_id {
            self.activator
                .activate_channel(&session_id, topic_id, agent_id)
                .await?;
        }
        Ok(())
    }

    /// Close a tab. Returns the active tab afterwards.
    ///
    /// Closing the active tab selects the tab now at the same index (clamped
    /// to the new last one), and that tab's channel is activated before the
    /// closed tab leaves the list.
    pub async fn close_tab(&self, agent_id: &str, topic_id: &str) -> Result<Option<String>> {
        let (session_id, successor) = {
            let agents = self.agents.lock();
            let entry = agents
                .get(agent_id)
                .ok_or_else(|| Error::NotFound(format!("agent {agent_id}")))?;
            let Some(index) = entry.tab_index(topic_id) else {
                return Ok(entry.stored.active.clone());
            };
            let was_active = entry.stored.active.as_deref() == Some(topic_id);
            let remaining = entry.stored.tabs.len() - 1;
            let successor = if was_active && remaining > 0 {
                let mut rest = entry.stored.tabs.clone();
                rest.remove(index);
                Some(rest[index.min(remaining - 1)].id.clone())
            } else {
                None
            };
            (entry.session_id.clone(), successor)
        };

        if let (Some(session_id), Some(successor)) = (&session_id, &successor) {
            self.activator
                .activate_channel(session_id, successor, agent_id)
                .await?;
        }

        let next = {
            let mut agents = self.agents.lock();
            let entry = agents
                .get_mut(agent_id)
                .ok_or_else(|| Error::NotFound(format!("agent {agent_id}")))?;
            let mut next = entry.stored.clone();
            next.tabs.retain(|t| t.id != topic_id);
            if next.active.as_deref() == Some(topic_id) {
                next.active = successor.or_else(|| next.tabs.first().map(|t| t.id.clone()));
            }
            entry.stored = next.clone();
            next
        };
        self.storage.save(agent_id, &next)?;
        debug!(agent_id, topic_id, active = ?next.active, "Tab closed");
        Ok(next.active)
    }

    /// Create a topic, put it first in both lists and activate it
    pub async fn create_topic(&self, agent_id: &str, title: Option<&str>) -> Result<Topic> {
        let session_id = self
            .agents
            .lock()
            .get(agent_id)
            .and_then(|a| a.session_id.clone())
            .ok_or_else(|| Error::NotFound(format!("session for agent {agent_id}")))?;

        let topic = self.api.create_topic(&session_id, title).await?;
        let next = {
            let mut agents = self.agents.lock();
            let entry = agents.entry(agent_id.to_string()).or_default();
            entry.topics.retain(|t| t.id != topic.id);
            entry.topics.insert(0, topic.clone());

            let mut next = entry.stored.clone();
            next.tabs.retain(|t| t.id != topic.id);
            let name = self.resolve_name(Some(&topic), &topic.id);
            next.tabs.insert(0, OpenTab::new(topic.id.clone(), name));
            next.active = Some(topic.id.clone());
            entry.stored = next.clone();
            next
        };
        self.storage.save(agent_id, &next)?;
        info!(agent_id, topic_id = %topic.id, "Topic created");

        self.activator
            .activate_channel(&session_id, &topic.id, agent_id)
            .await?;
        Ok(topic)
    }

    /// Delete a topic on the backend, then close its tab and release its channel
    pub async fn delete_topic(&self, agent_id: &str, topic_id: &str) -> Result<Option<String>> {
        self.api.delete_topic(topic_id).await?;
        let active = self.close_tab(agent_id, topic_id).await?;
        if let Some(entry) = self.agents.lock().get_mut(agent_id) {
            entry.topics.retain(|t| t.id != topic_id);
        }
        self.activator.release_channel(topic_id);
        Ok(active)
    }

    /// Rename a topic on the backend and everywhere it is cached
    pub async fn rename_topic(&self, topic_id: &str, title: &str) -> Result<()> {
        let patch = TopicPatch {
            title: Some(title.to_string()),
        };
        let topic = self.api.update_topic(topic_id, &patch).await?;
        self.apply_topic_rename(topic_id, topic.title.as_deref().unwrap_or(title))?;
        Ok(())
    }

    /// Apply an authoritative title to the topic cache and any open tab.
    /// Returns whether anything changed.
    pub fn apply_topic_rename(&self, topic_id: &str, title: &str) -> Result<bool> {
        if title.trim().is_empty() {
            return Ok(false);
        }
        let mut writes = Vec::new();
        {
            let mut agents = self.agents.lock();
            for (agent_id, entry) in agents.iter_mut() {
                if let Some(topic) = entry.topics.iter_mut().find(|t| t.id == topic_id) {
                    topic.title = Some(title.to_string());
                }
                if let Some(index) = entry.tab_index(topic_id) {
                    if entry.stored.tabs[index].name != title {
                        entry.stored.tabs[index].name = title.to_string();
                        writes.push((agent_id.clone(), entry.stored.clone()));
                    }
                }
            }
        }
        for (agent_id, stored) in &writes {
            self.storage.save(agent_id, stored)?;
        }
        Ok(!writes.is_empty())
    }

    /// Follow channel titles pushed through the store
    pub fn follow_titles(self: &Arc<Self>) -> StoreSubscription {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.store.subscribe(move |change| {
            let StoreChange::ChannelUpdated(channel_id) = change else {
                return;
            };
            let Some(reconciler) = weak.upgrade() else {
                return;
            };
            let Some(title) = reconciler.store.get(channel_id).and_then(|c| c.title) else {
                return;
            };
            if let Err(e) = reconciler.apply_topic_rename(channel_id, &title) {
                warn!(channel_id = %channel_id, error = %e, "Failed to persist tab rename");
            }
        })
    }

    /// Authoritative topic title, then derived channel title, then placeholder
    fn resolve_name(&self, topic: Option<&Topic>, topic_id: &str) -> String {
        topic
            .and_then(|t| t.title.clone())
            .filter(|title| !title.trim().is_empty())
            .or_else(|| self.store.get(topic_id).and_then(|c| c.derived_title()))
            .unwrap_or_else(|| self.placeholder.clone())
    }
}
