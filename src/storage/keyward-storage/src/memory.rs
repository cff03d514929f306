//! In-process storage backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::backend::{StorageBackend, Versioned};
use crate::batch::{WriteBatch, WriteOp};
use crate::error::StorageError;

/// Volatile backend keeping every row in a sorted map.
///
/// Cloning shares the underlying map, which is how several regional engines
/// can be pointed at one store in tests.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    rows: Arc<RwLock<BTreeMap<String, Versioned>>>,
}

impl MemoryBackend {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get_versioned(&self, key: &str) -> Result<Option<Versioned>, StorageError> {
        Ok(self.rows.read().await.get(key).cloned())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let mut rows = self.rows.write().await;

        for op in batch.ops() {
            let current = rows.get(op.key()).map(|row| row.version);
            if !op.precondition().holds(current) {
                debug!(key = op.key(), "Precondition failed");
                return Err(StorageError::Conflict(op.key().to_string()));
            }
        }

        for op in batch.into_ops() {
            match op {
                WriteOp::Put { key, value, .. } => {
                    let version = rows.get(&key).map_or(1, |row| row.version + 1);
                    rows.insert(key, Versioned { value, version });
                },
                WriteOp::Delete { key, .. } => {
                    rows.remove(&key);
                },
                WriteOp::Check { .. } => {},
            }
        }

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .rows
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}
