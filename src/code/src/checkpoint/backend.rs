//! Snapshot backend abstraction

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable, restorable snapshot of the working tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Paths captured in the snapshot, relative to the working directory
    pub files: Vec<String>,
}

impl Checkpoint {
    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }
}

/// Version-control mechanism behind the checkpoint manager.
///
/// Implementations own their storage; the manager serialises calls.
#[async_trait]
pub trait VersionControlBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the backend can run on this host
    async fn is_available(&self) -> bool;

    /// Create the backing store if it does not exist yet
    async fn init(&self) -> anyhow::Result<()>;

    /// Record the whole working tree
    async fn snapshot(&self, message: &str) -> anyhow::Result<Checkpoint>;

    /// All snapshots, most recent first
    async fn list(&self) -> anyhow::Result<Vec<Checkpoint>>;

    /// Expand a full or abbreviated id; `None` when it names no snapshot
    async fn resolve(&self, id: &str) -> anyhow::Result<Option<String>>;

    /// Reset the working tree to exactly the snapshot's content
    async fn restore(&self, id: &str) -> anyhow::Result<()>;

    /// Text diff from the snapshot to the current working tree
    async fn diff(&self, id: &str) -> anyhow::Result<String>;

    /// Store the current working tree without creating a snapshot
    async fn capture_tree(&self) -> anyhow::Result<String>;

    /// Reset the working tree to a tree returned by `capture_tree`
    async fn restore_tree(&self, tree: &str) -> anyhow::Result<()>;
}
