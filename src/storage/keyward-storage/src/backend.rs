//! Storage backend trait definition.

use async_trait::async_trait;

use crate::batch::WriteBatch;
use crate::error::StorageError;

/// A stored value together with its row version.
///
/// Versions start at 1 on creation and increase by one on every write, so a
/// reader can later commit a [`WriteBatch`] conditioned on the row being
/// unchanged since it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    /// Raw value bytes.
    pub value: Vec<u8>,
    /// Row version at read time.
    pub version: u64,
}

/// Storage backend trait for implementing different storage engines.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Get a value together with its version.
    async fn get_versioned(&self, key: &str) -> Result<Option<Versioned>, StorageError>;

    /// Atomically apply every write in `batch`, or none of them.
    ///
    /// Preconditions are evaluated against the state before the batch. If any
    /// precondition fails the call returns [`StorageError::Conflict`] and the
    /// store is left untouched.
    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError>;

    /// List keys starting with `prefix`, in ascending byte order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Get a value by key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.get_versioned(key).await?.map(|v| v.value))
    }

    /// Put a value with a key, unconditionally.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.put(key, value.to_vec());
        self.commit(batch).await
    }

    /// Delete a value by key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.commit(batch).await
    }

    /// Check if a key exists.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get_versioned(key).await?.is_some())
    }
}
