//! Relational catalog adapter
//!
//! The catalog maps `(task_id, file_path)` to the container that holds the
//! member plus the worker that packed it. Records are insert-only; a second
//! insert for the same key is a conflict, never an update.

use async_trait::async_trait;
use cafio_common::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// One file-to-container mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: i64,
    pub file_path: String,
    pub task_id: String,
    /// Container name holding this file
    pub bundle_id: String,
    pub js_worker_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistent worker identity row; supplies the credentials used by the
/// remote blob adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub id: u16,
    pub address: String,
    pub seed: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Capability set of the catalog backend.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Insert an immutable record. Duplicate `(task_id, file_path)` keys
    /// are a `Conflict` error.
    async fn insert(
        &self,
        task_id: &str,
        file_path: &str,
        container_name: &str,
        worker_id: u16,
    ) -> Result<()>;

    /// Look up the record for `(task_id, file_path)`.
    async fn lookup(&self, task_id: &str, file_path: &str) -> Result<Option<CatalogRecord>>;

    /// Fetch the identity row for `worker_id`.
    async fn worker(&self, worker_id: u16) -> Result<Option<WorkerIdentity>>;

    /// Create (or refresh) the identity row for `worker_id`.
    async fn register_worker(&self, worker_id: u16, address: &str, seed: &str) -> Result<()>;
}

// ── redb-backed catalog ───────────────────────────────────────────────────────

/// Records: "task_id\x00file_path" → JSON(CatalogRecord)
const RECORDS: TableDefinition<&str, &str> = TableDefinition::new("records");
/// Workers: worker_id → JSON(WorkerIdentity)
const WORKERS: TableDefinition<u64, &str> = TableDefinition::new("workers");
/// Counters: name → next value
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

const RECORD_SEQ: &str = "record_seq";

fn record_key(task_id: &str, file_path: &str) -> String {
    format!("{task_id}\u{0}{file_path}")
}

/// Catalog persisted in an embedded redb database.
pub struct RedbCatalog {
    db: Arc<Database>,
}

impl RedbCatalog {
    /// Open (or create) the catalog database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)
            .map_err(|e| Error::ConnectionFailed(format!("open catalog database: {e}")))?;

        // Ensure all tables exist so reads never race table creation.
        let wtx = db.begin_write().map_err(db_err)?;
        wtx.open_table(RECORDS).map_err(db_err)?;
        wtx.open_table(WORKERS).map_err(db_err)?;
        wtx.open_table(COUNTERS).map_err(db_err)?;
        wtx.commit().map_err(db_err)?;

        Ok(Self { db: Arc::new(db) })
    }
}

fn db_err(e: impl std::fmt::Display) -> Error {
    Error::Internal(format!("catalog database error: {e}"))
}

#[async_trait]
impl Catalog for RedbCatalog {
    async fn insert(
        &self,
        task_id: &str,
        file_path: &str,
        container_name: &str,
        worker_id: u16,
    ) -> Result<()> {
        let key = record_key(task_id, file_path);
        let wtx = self.db.begin_write().map_err(db_err)?;
        {
            let mut counters = wtx.open_table(COUNTERS).map_err(db_err)?;
            let seq = counters
                .get(RECORD_SEQ)
                .map_err(db_err)?
                .map(|v| v.value())
                .unwrap_or(0);

            let mut records = wtx.open_table(RECORDS).map_err(db_err)?;
            if records.get(key.as_str()).map_err(db_err)?.is_some() {
                return Err(Error::Conflict(format!("{task_id}/{file_path}")));
            }

            let now = Utc::now();
            let record = CatalogRecord {
                id: seq as i64 + 1,
                file_path: file_path.to_string(),
                task_id: task_id.to_string(),
                bundle_id: container_name.to_string(),
                js_worker_id: worker_id.to_string(),
                created_at: now,
                updated_at: now,
            };
            let json = serde_json::to_string(&record).map_err(db_err)?;
            records.insert(key.as_str(), json.as_str()).map_err(db_err)?;
            counters.insert(RECORD_SEQ, seq + 1).map_err(db_err)?;
        }
        wtx.commit().map_err(db_err)?;
        Ok(())
    }

    async fn lookup(&self, task_id: &str, file_path: &str) -> Result<Option<CatalogRecord>> {
        let key = record_key(task_id, file_path);
        let rtx = self.db.begin_read().map_err(db_err)?;
        let table = rtx.open_table(RECORDS).map_err(db_err)?;
        match table.get(key.as_str()).map_err(db_err)? {
            Some(guard) => {
                let record = serde_json::from_str(guard.value()).map_err(db_err)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn worker(&self, worker_id: u16) -> Result<Option<WorkerIdentity>> {
        let rtx = self.db.begin_read().map_err(db_err)?;
        let table = rtx.open_table(WORKERS).map_err(db_err)?;
        match table.get(u64::from(worker_id)).map_err(db_err)? {
            Some(guard) => {
                let identity = serde_json::from_str(guard.value()).map_err(db_err)?;
                Ok(Some(identity))
            }
            None => Ok(None),
        }
    }

    async fn register_worker(&self, worker_id: u16, address: &str, seed: &str) -> Result<()> {
        let now = Utc::now();
        let wtx = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wtx.open_table(WORKERS).map_err(db_err)?;
            let created_at = table
                .get(u64::from(worker_id))
                .map_err(db_err)?
                .and_then(|v| serde_json::from_str::<WorkerIdentity>(v.value()).ok())
                .map(|w| w.created_at)
                .unwrap_or(now);

            let identity = WorkerIdentity {
                id: worker_id,
                address: address.to_string(),
                seed: seed.to_string(),
                created_at,
                updated_at: now,
            };
            let json = serde_json::to_string(&identity).map_err(db_err)?;
            table
                .insert(u64::from(worker_id), json.as_str())
                .map_err(db_err)?;
        }
        wtx.commit().map_err(db_err)?;
        Ok(())
    }
}

// ── In-memory catalog ─────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    records: HashMap<(String, String), CatalogRecord>,
    workers: HashMap<u16, WorkerIdentity>,
    next_id: i64,
}

/// In-memory catalog for tests and local development.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: RwLock<MemoryInner>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records, for test assertions.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.inner.read().records.len()
    }

    /// Synchronous lookup, for test assertions.
    #[must_use]
    pub fn get(&self, task_id: &str, file_path: &str) -> Option<CatalogRecord> {
        let key = (task_id.to_string(), file_path.to_string());
        self.inner.read().records.get(&key).cloned()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn insert(
        &self,
        task_id: &str,
        file_path: &str,
        container_name: &str,
        worker_id: u16,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        let key = (task_id.to_string(), file_path.to_string());
        if inner.records.contains_key(&key) {
            return Err(Error::Conflict(format!("{task_id}/{file_path}")));
        }
        inner.next_id += 1;
        let now = Utc::now();
        let record = CatalogRecord {
            id: inner.next_id,
            file_path: file_path.to_string(),
            task_id: task_id.to_string(),
            bundle_id: container_name.to_string(),
            js_worker_id: worker_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.records.insert(key, record);
        Ok(())
    }

    async fn lookup(&self, task_id: &str, file_path: &str) -> Result<Option<CatalogRecord>> {
        let key = (task_id.to_string(), file_path.to_string());
        Ok(self.inner.read().records.get(&key).cloned())
    }

    async fn worker(&self, worker_id: u16) -> Result<Option<WorkerIdentity>> {
        Ok(self.inner.read().workers.get(&worker_id).cloned())
    }

    async fn register_worker(&self, worker_id: u16, address: &str, seed: &str) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.write();
        let created_at = inner
            .workers
            .get(&worker_id)
            .map(|w| w.created_at)
            .unwrap_or(now);
        inner.workers.insert(
            worker_id,
            WorkerIdentity {
                id: worker_id,
                address: address.to_string(),
                seed: seed.to_string(),
                created_at,
                updated_at: now,
            },
        );
        Ok(())
    }
}
