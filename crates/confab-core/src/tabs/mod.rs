//! Per-agent open tabs
//!
//! [`TabReconciler`] owns the tab lists; [`TabStorage`] is where they are
//! cached between runs.

mod reconciler;
mod storage;

pub use reconciler::TabReconciler;
pub use storage::{FileTabStorage, MemoryTabStorage, OpenTab, StoredTabs, TabStorage};
