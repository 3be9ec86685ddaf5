//! Request store
//!
//! [`RequestStore`] is the persistence seam. Every multi-row change goes
//! through [`RequestStore::modify`], which applies a mutation to one request
//! and all of its rows atomically and recomputes `fully_approved`.
//!
//! [`SqliteStore`] is the durable backend; [`MemoryStore`] keeps everything
//! in process and is meant for development and tests. [`StoreDsn`] selects
//! one of them.

pub mod sqlite;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube_jit_common::clock::SharedClock;
use parking_lot::RwLock;

use crate::model::{RecordFilter, RequestId, RequestRecord, RequestStatus};

pub use sqlite::{SqliteSettings, SqliteStore};

/// Store failures
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No such request
    #[error("request {0} not found")]
    NotFound(RequestId),
    /// The mutation refused to apply
    #[error("{0}")]
    Rejected(String),
    /// Backend I/O failure
    #[error("backend: {0}")]
    Backend(String),
}

/// Mutation applied inside a store transaction
pub type Mutation<'a> = &'a mut (dyn FnMut(&mut RequestRecord) -> Result<(), StoreError> + Send);

/// Persistence for requests and their approval rows
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a request with its rows; the store assigns the id.
    async fn insert(&self, record: RequestRecord) -> Result<RequestRecord, StoreError>;

    /// Fetch one request
    async fn get(&self, id: RequestId) -> Result<Option<RequestRecord>, StoreError>;

    /// Apply `mutation` atomically and return the updated record.
    ///
    /// If the mutation fails nothing is written.
    async fn modify(&self, id: RequestId, mutation: Mutation<'_>)
        -> Result<RequestRecord, StoreError>;

    /// Delete requests still `Requested` whose end lies before `now`.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<RequestId>, StoreError>;

    /// Records matching `filter`, newest first
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<RequestRecord>, StoreError>;
}

/// Backend selected by the `--database-dsn` flag
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreDsn {
    /// `memory:`, nothing survives a restart
    Memory,
    /// `sqlite://<path>` or `sqlite:<path>`
    Sqlite(PathBuf),
}

impl FromStr for StoreDsn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "memory" || s == "memory:" {
            return Ok(Self::Memory);
        }
        let path = s
            .strip_prefix("sqlite://")
            .or_else(|| s.strip_prefix("sqlite:"))
            .ok_or_else(|| {
                format!(
                    "unsupported database dsn '{}', expected sqlite://<path> or memory:",
                    s
                )
            })?;
        if path.is_empty() {
            return Err("sqlite dsn is missing the database path".to_string());
        }
        Ok(Self::Sqlite(PathBuf::from(path)))
    }
}

/// Open the store behind `dsn`.
///
/// `pool` tunes the SQLite connections and is ignored for `memory:`.
pub fn open_store(
    dsn: &StoreDsn,
    pool: impl FnOnce(PathBuf) -> SqliteSettings,
    clock: SharedClock,
) -> Result<Arc<dyn RequestStore>, StoreError> {
    Ok(match dsn {
        StoreDsn::Memory => Arc::new(MemoryStore::new(clock)),
        StoreDsn::Sqlite(path) => Arc::new(SqliteStore::open(&pool(path.clone()), clock)?),
    })
}

/// In-process store
pub struct MemoryStore {
    records: RwLock<BTreeMap<RequestId, RequestRecord>>,
    next_id: AtomicU64,
    clock: SharedClock,
}

impl MemoryStore {
    /// Create an empty store; ids start at 1
    pub fn new(clock: SharedClock) -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            clock,
        }
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn insert(&self, mut record: RequestRecord) -> Result<RequestRecord, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = self.clock.now();
        record.request.id = id;
        record.request.created_at = now;
        record.request.updated_at = now;
        for row in &mut record.namespace_approvals {
            row.request_id = id;
        }
        record.refresh_fully_approved();
        self.records.write().insert(id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: RequestId) -> Result<Option<RequestRecord>, StoreError> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn modify(
        &self,
        id: RequestId,
        mutation: Mutation<'_>,
    ) -> Result<RequestRecord, StoreError> {
        let mut records = self.records.write();
        let current = records.get(&id).ok_or(StoreError::NotFound(id))?;
        let mut updated = current.clone();
        mutation(&mut updated)?;
        updated.refresh_fully_approved();
        if &updated != current {
            updated.request.updated_at = self.clock.now();
        }
        records.insert(id, updated.clone());
        Ok(updated)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<RequestId>, StoreError> {
        let mut records = self.records.write();
        let expired: Vec<RequestId> = records
            .values()
            .filter(|r| r.request.status == RequestStatus::Requested && r.request.end_date < now)
            .map(|r| r.request.id)
            .collect();
        for id in &expired {
            records.remove(id);
        }
        Ok(expired)
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<RequestRecord>, StoreError> {
        let records = self.records.read();
        let matching = records
            .values()
            .rev()
            .filter(|r| r.request.deleted_at.is_none() && filter.matches(&r.request))
            .cloned();
        Ok(match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }
}
