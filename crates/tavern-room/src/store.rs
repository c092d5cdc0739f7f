//! Persistence boundary: where snapshots live between turns.
//!
//! The document store itself is external. Rooms use it in two places:
//! a joiner arriving before any turn has started gets the snapshot the
//! session's set reference points at, and every started turn is
//! checkpointed back under that same reference.

use std::collections::HashMap;
use std::future::Future;

use tavern_protocol::{SetRef, Snapshot};
use tokio::sync::RwLock;

/// Errors reported by a snapshot store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
}

/// Reads and writes game snapshots keyed by set reference.
///
/// Futures must be `Send` because rooms run store calls on their own
/// Tokio tasks, never inside the room's command loop.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Whether this store is backed by anything. Rooms skip the deferred
    /// load and the checkpoint writer for a disabled store.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Fetches the snapshot stored under `set`, if any.
    fn load(
        &self,
        set: &SetRef,
    ) -> impl Future<Output = Result<Option<Snapshot>, StoreError>> + Send;

    /// Stores `snapshot` under `set`, replacing what was there.
    fn save(
        &self,
        set: &SetRef,
        snapshot: &Snapshot,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// In-process store. Snapshots survive room reaping but not a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<SetRef, Snapshot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-seeded with one game definition.
    pub fn with_snapshot(set: SetRef, snapshot: Snapshot) -> Self {
        Self {
            snapshots: RwLock::new(HashMap::from([(set, snapshot)])),
        }
    }
}

impl SnapshotStore for MemoryStore {
    async fn load(&self, set: &SetRef) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.snapshots.read().await.get(set).cloned())
    }

    async fn save(&self, set: &SetRef, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .insert(set.clone(), snapshot.clone());
        tracing::debug!(%set, bytes = snapshot.as_str().len(), "snapshot saved");
        Ok(())
    }
}

/// A store that holds nothing. Joiners get whatever the session has
/// cached and clients fetch definitions themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStore;

impl SnapshotStore for NoStore {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn load(&self, _set: &SetRef) -> Result<Option<Snapshot>, StoreError> {
        Ok(None)
    }

    async fn save(&self, _set: &SetRef, _snapshot: &Snapshot) -> Result<(), StoreError> {
        Ok(())
    }
}
