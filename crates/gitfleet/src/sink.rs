//! The upstream interface: one [`ChangeRecord`] per applied tag.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One logical change spanning the repository fleet. `revision` names the
/// freshly applied tag rather than any single commit hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub revision: String,
    /// Comma-joined sorted set of contributing author names.
    pub author: String,
    /// Latest commit time in the summarised range, seconds since epoch.
    pub when: i64,
    /// Sorted unique changed paths, prefixed with the repository name.
    pub files: Vec<String>,
    /// Per-revision summary blocks in commit-time order.
    pub comments: String,
    pub project: String,
    pub branch: String,
}

/// Where emitted changes go. Called exactly once per successfully applied
/// tag; a sink failure aborts the poll cycle.
#[async_trait]
pub trait ChangeSink: Send + Sync {
    async fn record_change(&self, change: ChangeRecord) -> anyhow::Result<()>;
}

/// In-memory sink, useful for tests and for drivers that drain changes
/// between polls.
#[derive(Default)]
pub struct MemorySink {
    changes: std::sync::Mutex<Vec<ChangeRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<ChangeRecord> {
        self.changes.lock().expect("sink lock poisoned").clone()
    }
}

#[async_trait]
impl ChangeSink for MemorySink {
    async fn record_change(&self, change: ChangeRecord) -> anyhow::Result<()> {
        self.changes.lock().expect("sink lock poisoned").push(change);
        Ok(())
    }
}
