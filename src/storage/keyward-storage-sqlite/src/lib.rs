//! # Keyward Storage - SQLite Backend
//!
//! Durable implementation of the storage contract. Every store lives in its
//! own database file; each row carries a version used for compare-and-swap,
//! and every write is mirrored into an append-only `kv_history` table.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::Mutex;
use tracing::{debug, info};

use keyward_storage::{StorageBackend, StorageError, Versioned, WriteBatch, WriteOp};

/// SQLite storage backend.
///
/// The database lives at `{base_path}/{name}.db`. Batches are committed inside
/// a single SQLite transaction; writers within one process are serialised so
/// precondition checks and writes observe the same snapshot.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    actor: Option<String>,
    write_lock: Arc<Mutex<()>>,
}

fn query_failed(e: sqlx::Error) -> StorageError {
    StorageError::QueryFailed(e.to_string())
}

impl SqliteBackend {
    /// Opens or creates a SQLite store.
    ///
    /// # Arguments
    ///
    /// * `base_path` - Directory where store databases are kept
    /// * `name` - Store name (must match `[a-z0-9_-]+`)
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The store name is invalid
    /// - Directory cannot be created
    /// - Database connection fails
    pub async fn open(base_path: impl AsRef<Path>, name: &str) -> Result<Self, StorageError> {
        Self::validate_name(name)?;

        let base = base_path.as_ref();
        std::fs::create_dir_all(base).map_err(|e| {
            StorageError::ConnectionFailed(format!("failed to create directory: {e}"))
        })?;

        let db_path = base.join(format!("{name}.db"));
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        debug!(store = %name, path = %db_path.display(), "Opening SQLite database");

        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        let backend = Self {
            pool,
            actor: None,
            write_lock: Arc::new(Mutex::new(())),
        };

        backend.migrate().await?;

        info!(store = %name, "SQLite backend ready");

        Ok(backend)
    }

    /// Sets the actor recorded in `kv_history` for every write made through
    /// this handle.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Only allows: lowercase letters, digits, underscore, hyphen.
    fn validate_name(name: &str) -> Result<(), StorageError> {
        if name.is_empty() {
            return Err(StorageError::InvalidInput("store name cannot be empty".into()));
        }

        if name.len() > 64 {
            return Err(StorageError::InvalidInput("store name too long".into()));
        }

        let valid = name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');

        if !valid {
            return Err(StorageError::InvalidInput(
                "store name must match [a-z0-9_-]+".into(),
            ));
        }

        Ok(())
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        debug!("Running database migrations");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                version    INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS kv_history (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                key        TEXT NOT NULL,
                value      BLOB,
                version    INTEGER NOT NULL,
                operation  TEXT NOT NULL,
                actor      TEXT,
                timestamp  INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_history_key ON kv_history (key)",
            "CREATE INDEX IF NOT EXISTS idx_history_timestamp ON kv_history (timestamp)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::ConnectionFailed(format!("migration failed: {e}")))?;
        }

        debug!("Migrations complete");

        Ok(())
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    async fn current_version(
        conn: &mut SqliteConnection,
        key: &str,
    ) -> Result<Option<i64>, StorageError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(query_failed)?;
        Ok(row.map(|(v,)| v))
    }

    async fn record_history(
        &self,
        conn: &mut SqliteConnection,
        key: &str,
        value: Option<&[u8]>,
        version: i64,
        operation: &str,
        now: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO kv_history (key, value, version, operation, actor, timestamp) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(version)
        .bind(operation)
        .bind(self.actor.as_deref())
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(query_failed)?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn get_versioned(&self, key: &str) -> Result<Option<Versioned>, StorageError> {
        let row: Option<(Vec<u8>, i64)> =
            sqlx::query_as("SELECT value, version FROM kv_store WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(query_failed)?;

        Ok(row.map(|(value, version)| Versioned {
            value,
            version: version as u64,
        }))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(query_failed)?;

        for op in batch.ops() {
            let current = Self::current_version(&mut tx, op.key()).await?;
            if !op.precondition().holds(current.map(|v| v as u64)) {
                debug!(key = op.key(), "Precondition failed, rolling back");
                return Err(StorageError::Conflict(op.key().to_string()));
            }
        }

        let now = Self::now();

        for op in batch.into_ops() {
            match op {
                WriteOp::Put { key, value, .. } => {
                    let (version, operation) = match Self::current_version(&mut tx, &key).await? {
                        Some(v) => (v + 1, "update"),
                        None => (1, "create"),
                    };

                    sqlx::query(
                        r#"
                        INSERT INTO kv_store (key, value, version, created_at, updated_at)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT(key) DO UPDATE SET
                            value = excluded.value,
                            version = excluded.version,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(&key)
                    .bind(&value)
                    .bind(version)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(query_failed)?;

                    self.record_history(&mut tx, &key, Some(&value), version, operation, now)
                        .await?;
                },
                WriteOp::Delete { key, .. } => {
                    if let Some(version) = Self::current_version(&mut tx, &key).await? {
                        sqlx::query("DELETE FROM kv_store WHERE key = ?")
                            .bind(&key)
                            .execute(&mut *tx)
                            .await
                            .map_err(query_failed)?;

                        self.record_history(&mut tx, &key, None, version + 1, "delete", now)
                            .await?;
                    }
                },
                WriteOp::Check { .. } => {},
            }
        }

        tx.commit().await.map_err(query_failed)?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // LIKE treats `_` as a wildcard and folds ASCII case, so compare the
        // prefix directly instead.
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM kv_store WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed)?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use keyward_storage::Precondition;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteBackend) {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteBackend::open(tmp.path(), "keyward").await.unwrap();
        (tmp, backend)
    }

    #[tokio::test]
    async fn test_open_creates_db() {
        let tmp = TempDir::new().unwrap();
        let _backend = SqliteBackend::open(tmp.path(), "eu-west-1").await.unwrap();

        let db_path = tmp.path().join("eu-west-1.db");
        assert!(db_path.exists(), "database file should be created");
    }

    #[tokio::test]
    async fn test_name_validation() {
        let tmp = TempDir::new().unwrap();

        for name in ["", "Store", "my store", "store/sub", "../escape", "store.db"] {
            let result = SqliteBackend::open(tmp.path(), name).await;
            assert!(
                matches!(result, Err(StorageError::InvalidInput(_))),
                "should reject store name: {name:?}"
            );
        }

        for name in ["store", "my-store", "store_1", "123"] {
            let result = SqliteBackend::open(tmp.path(), name).await;
            assert!(result.is_ok(), "should accept store name: {name}");
        }
    }

    #[tokio::test]
    async fn test_crud_roundtrip() {
        let (_tmp, backend) = setup().await;

        assert!(backend.get("key/us-east-1/k1").await.unwrap().is_none());

        backend.put("key/us-east-1/k1", b"record").await.unwrap();
        assert_eq!(
            backend.get("key/us-east-1/k1").await.unwrap(),
            Some(b"record".to_vec())
        );

        backend.put("key/us-east-1/k1", b"record-2").await.unwrap();
        let row = backend.get_versioned("key/us-east-1/k1").await.unwrap().unwrap();
        assert_eq!(row.value, b"record-2".to_vec());
        assert_eq!(row.version, 2);

        backend.delete("key/us-east-1/k1").await.unwrap();
        assert!(!backend.exists("key/us-east-1/k1").await.unwrap());

        backend.delete("nonexistent").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_prefix_is_literal_and_sorted() {
        let (_tmp, backend) = setup().await;

        backend.put("grant-by-retiree/r/arn_role/g2", b"1").await.unwrap();
        backend.put("grant-by-retiree/r/arn_role/g1", b"1").await.unwrap();
        backend.put("grant-by-retiree/r/arnXrole/g3", b"1").await.unwrap();
        backend.put("grant-by-retiree/r/ARN_ROLE/g4", b"1").await.unwrap();

        let keys = backend.list("grant-by-retiree/r/arn_role/").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "grant-by-retiree/r/arn_role/g1".to_string(),
                "grant-by-retiree/r/arn_role/g2".to_string(),
            ]
        );

        assert_eq!(backend.list("").await.unwrap().len(), 4);
        assert!(backend.list("alias/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_is_atomic() {
        let (_tmp, backend) = setup().await;
        backend.put("key/r/k", b"v1").await.unwrap();

        let mut batch = WriteBatch::new();
        batch
            .put("grant/r/g", b"grant".to_vec())
            .put_if("key/r/k", b"v2".to_vec(), Precondition::Version(5));

        let result = backend.commit(batch).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
        assert!(backend.get("grant/r/g").await.unwrap().is_none());
        assert_eq!(backend.get("key/r/k").await.unwrap(), Some(b"v1".to_vec()));

        let mut batch = WriteBatch::new();
        batch
            .put("grant/r/g", b"grant".to_vec())
            .put_if("key/r/k", b"v2".to_vec(), Precondition::Version(1))
            .check("alias/r/a", Precondition::Absent);
        backend.commit(batch).await.unwrap();
        assert_eq!(backend.get("key/r/k").await.unwrap(), Some(b"v2".to_vec()));
        assert!(backend.exists("grant/r/g").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_cas_has_single_winner() {
        let (_tmp, backend) = setup().await;
        backend.put("key/r/k", b"v1").await.unwrap();

        let attempt = |value: &'static [u8]| {
            let backend = backend.clone();
            async move {
                let mut batch = WriteBatch::new();
                batch.put_if("key/r/k", value.to_vec(), Precondition::Version(1));
                backend.commit(batch).await
            }
        };

        let (a, b) = tokio::join!(attempt(b"a"), attempt(b"b"));
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
    }

    #[tokio::test]
    async fn test_history_records_operations_with_actor() {
        let (_tmp, backend) = setup().await;
        let backend = backend.with_actor("keyward:us-east-1");

        backend.put("key", b"v1").await.unwrap();
        backend.put("key", b"v2").await.unwrap();
        backend.delete("key").await.unwrap();

        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT operation, version, actor FROM kv_history WHERE key = ? ORDER BY id",
        )
        .bind("key")
        .fetch_all(&backend.pool)
        .await
        .unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].0, "create");
        assert_eq!(rows[1], ("update".to_string(), 2, "keyward:us-east-1".to_string()));
        assert_eq!(rows[2].0, "delete");
        assert_eq!(rows[2].1, 3);
    }

    #[tokio::test]
    async fn test_binary_data() {
        let (_tmp, backend) = setup().await;

        let binary_data: Vec<u8> = (0..=255).collect();
        backend.put("binary", &binary_data).await.unwrap();

        let result = backend.get("binary").await.unwrap();
        assert_eq!(result, Some(binary_data));
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let tmp = TempDir::new().unwrap();
        {
            let backend = SqliteBackend::open(tmp.path(), "persist").await.unwrap();
            backend.put("key/r/k", b"durable").await.unwrap();
        }
        let backend = SqliteBackend::open(tmp.path(), "persist").await.unwrap();
        assert_eq!(backend.get("key/r/k").await.unwrap(), Some(b"durable".to_vec()));
    }
}
