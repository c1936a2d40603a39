//! Tab persistence - advisory cache of each agent's open tabs
//!
//! Authoritative names and ordering of topics always come from the backend;
//! this file only remembers which tabs were open and which one was active.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const TABS_FILE: &str = "open_tabs.json";

/// One open tab
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenTab {
    /// Topic id
    pub id: String,
    /// Cached display name
    pub name: String,
}

impl OpenTab {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Persisted tab state of one agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTabs {
    pub tabs: Vec<OpenTab>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<String>,
}

/// Client-local storage for open tabs, keyed by agent id
pub trait TabStorage: Send + Sync {
    fn load(&self, agent_id: &str) -> Result<Option<StoredTabs>>;
    fn save(&self, agent_id: &str, tabs: &StoredTabs) -> Result<()>;
}

/// All agents' tabs in a single JSON file
pub struct FileTabStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileTabStorage {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(TABS_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, StoredTabs>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let json = std::fs::read_to_string(&self.path)?;
        match serde_json::from_str(&json) {
            Ok(all) => Ok(all),
            Err(e) => {
                // Advisory cache: a corrupt file is treated as empty
                warn!("Ignoring unreadable tab file {:?}: {}", self.path, e);
                Ok(HashMap::new())
            }
        }
    }
}

impl TabStorage for FileTabStorage {
    fn load(&self, agent_id: &str) -> Result<Option<StoredTabs>> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.remove(agent_id))
    }

    fn save(&self, agent_id: &str, tabs: &StoredTabs) -> Result<()> {
        let _guard = self.lock.lock();
        let mut all = self.read_all()?;
        all.insert(agent_id.to_string(), tabs.clone());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create tabs dir: {}", e)))?;
        }
        let json = serde_json::to_string_pretty(&all)?;
        std::fs::write(&self.path, json)
            .map_err(|e| Error::Storage(format!("Failed to write tabs: {}", e)))?;
        debug!(agent_id, tabs = tabs.tabs.len(), "Saved open tabs");
        Ok(())
    }
}

/// In-memory storage that counts writes
#[derive(Default)]
pub struct MemoryTabStorage {
    entries: Mutex<HashMap<String, StoredTabs>>,
    writes: AtomicUsize,
}

impl MemoryTabStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an agent's tabs without counting a write
    pub fn with_tabs(self, agent_id: impl Into<String>, tabs: StoredTabs) -> Self {
        self.entries.lock().insert(agent_id.into(), tabs);
        self
    }

    pub fn snapshot(&self, agent_id: &str) -> Option<StoredTabs> {
        self.entries.lock().get(agent_id).cloned()
    }

    /// Number of `save` calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl TabStorage for MemoryTabStorage {
    fn load(&self, agent_id: &str) -> Result<Option<StoredTabs>> {
        Ok(self.snapshot(agent_id))
    }

    fn save(&self, agent_id: &str, tabs: &StoredTabs) -> Result<()> {
        self.entries.lock().insert(agent_id.to_string(), tabs.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
