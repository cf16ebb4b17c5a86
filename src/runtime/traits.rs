//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the executor with mock implementations.

use crate::conversation::Conversation;
use crate::db::Database;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Receives finalized conversation snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save_snapshot(&self, conversation: &Conversation) -> Result<(), String>;
}

/// Turns a local file into a durable URL a message can embed
#[async_trait]
pub trait ImageHost: Send + Sync {
    async fn resolve(&self, path: &Path) -> Result<String, String>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: SnapshotStore + ?Sized> SnapshotStore for Arc<T> {
    async fn save_snapshot(&self, conversation: &Conversation) -> Result<(), String> {
        (**self).save_snapshot(conversation).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as `SnapshotStore`
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SnapshotStore for DatabaseStorage {
    async fn save_snapshot(&self, conversation: &Conversation) -> Result<(), String> {
        self.db.save_snapshot(conversation).map_err(|e| e.to_string())
    }
}

/// Image host for a single machine: the durable URL is a `file://` URL
/// to the canonical path
pub struct LocalImageHost;

#[async_trait]
impl ImageHost for LocalImageHost {
    async fn resolve(&self, path: &Path) -> Result<String, String> {
        let canonical = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| format!("{}: {e}", path.display()))?;
        let metadata = tokio::fs::metadata(&canonical)
            .await
            .map_err(|e| format!("{}: {e}", canonical.display()))?;
        if !metadata.is_file() {
            return Err(format!("{} is not a file", canonical.display()));
        }
        Ok(format!("file://{}", canonical.display()))
    }
}
