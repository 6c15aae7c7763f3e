//! Durable checkpoint storage.

use async_trait::async_trait;
use ledgerflow_flow::Checkpoint;
use ledgerflow_types::FlowId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Checkpoint storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The checkpoint could not be (de)serialized.
    #[error("checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The backing store rejected the operation.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for flow checkpoints.
///
/// `save` replaces any previous checkpoint for the flow wholesale and must
/// be atomic: after a crash, either the old or the new snapshot is read
/// back, never a mix.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Write a checkpoint, replacing any existing one for the same flow.
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), StorageError>;

    /// Read a flow's checkpoint back, if one exists.
    async fn load(&self, flow_id: FlowId) -> Result<Option<Checkpoint>, StorageError>;

    /// Remove a flow's checkpoint.
    async fn delete(&self, flow_id: FlowId) -> Result<(), StorageError>;

    /// All stored checkpoints, for restart recovery.
    async fn list(&self) -> Result<Vec<Checkpoint>, StorageError>;
}

/// Store backed by a serialized map. Checkpoints round-trip through their
/// wire form on every save, so anything unserializable fails here rather
/// than in a real deployment.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    rows: Mutex<HashMap<FlowId, String>>,
    /// Number of upcoming saves to fail, for fault-injection tests.
    fail_saves: AtomicU32,
}

impl InMemoryCheckpointStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` saves fail with [`StorageError::Unavailable`].
    pub fn fail_next_saves(&self, count: u32) {
        self.fail_saves.store(count, Ordering::SeqCst);
    }

    /// Number of checkpoints currently stored.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Whether the store holds no checkpoints.
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<(), StorageError> {
        if self
            .fail_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::Unavailable("injected save failure".into()));
        }
        let row = serde_json::to_string(&checkpoint)?;
        self.rows.lock().insert(checkpoint.flow_id, row);
        Ok(())
    }

    async fn load(&self, flow_id: FlowId) -> Result<Option<Checkpoint>, StorageError> {
        let row = self.rows.lock().get(&flow_id).cloned();
        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, flow_id: FlowId) -> Result<(), StorageError> {
        self.rows.lock().remove(&flow_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, StorageError> {
        let rows: Vec<String> = self.rows.lock().values().cloned().collect();
        rows.iter()
            .map(|row| serde_json::from_str(row).map_err(StorageError::from))
            .collect()
    }
}
