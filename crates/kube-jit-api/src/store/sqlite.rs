//! SQLite-backed request store
//!
//! Requests live in `requests` (indexed columns plus the JSON body) and their
//! approval rows in `namespace_approvals`, deleted with the request through a
//! cascading foreign key.
//!
//! Statements run on the blocking pool. [`RequestStore::modify`] loads the
//! record, applies the mutation, then writes request and rows in one
//! `IMMEDIATE` transaction guarded by the row's `version` column. A write that
//! lost a race re-runs the mutation on the fresh record.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube_jit_common::clock::SharedClock;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use super::{Mutation, RequestStore, StoreError};
use crate::model::{NamespaceApproval, RecordFilter, Request, RequestId, RequestRecord};

/// Schema version written to `store_meta`
const SCHEMA_VERSION: i64 = 1;

/// How often `modify` re-runs a mutation that lost a write race
const MAX_MODIFY_ATTEMPTS: u32 = 16;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS requests (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    version           INTEGER NOT NULL DEFAULT 0,
    status            TEXT    NOT NULL,
    user_id           TEXT    NOT NULL,
    username          TEXT    NOT NULL,
    created_ms        INTEGER NOT NULL,
    end_ms            INTEGER NOT NULL,
    deleted_ms        INTEGER,
    applied_callbacks TEXT    NOT NULL,
    body              TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS requests_status_end ON requests (status, end_ms);
CREATE INDEX IF NOT EXISTS requests_user ON requests (user_id);
CREATE TABLE IF NOT EXISTS namespace_approvals (
    request_id    INTEGER NOT NULL REFERENCES requests (id) ON DELETE CASCADE,
    position      INTEGER NOT NULL,
    namespace     TEXT    NOT NULL,
    group_id      TEXT    NOT NULL,
    group_name    TEXT    NOT NULL,
    approved      INTEGER NOT NULL,
    approver_id   TEXT,
    approver_name TEXT,
    PRIMARY KEY (request_id, namespace)
);
";

/// Connection settings
#[derive(Clone, Debug)]
pub struct SqliteSettings {
    /// Database file
    pub path: PathBuf,
    /// Read-only connections next to the single writer
    pub read_pool_size: usize,
    /// How long a statement waits for a lock held by another connection
    pub busy_timeout: Duration,
}

impl SqliteSettings {
    /// Settings for `path` with the defaults used by the binary
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_pool_size: 4,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

struct Inner {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
    cursor: AtomicUsize,
}

impl Inner {
    fn reader(&self) -> MutexGuard<'_, Connection> {
        if self.readers.is_empty() {
            return self.writer.lock();
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        self.readers[i].lock()
    }
}

/// Durable [`RequestStore`] on a local SQLite file
pub struct SqliteStore {
    inner: Arc<Inner>,
    clock: SharedClock,
}

impl SqliteStore {
    /// Open (creating if needed) the database described by `settings`.
    pub fn open(settings: &SqliteSettings, clock: SharedClock) -> Result<Self, StoreError> {
        if let Some(dir) = settings.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                StoreError::Backend(format!("creating {}: {}", dir.display(), e))
            })?;
        }

        let mut writer = open_connection(&settings.path, settings.busy_timeout)?;
        initialize_schema(&mut writer)?;
        let readers = (0..settings.read_pool_size)
            .map(|_| open_connection(&settings.path, settings.busy_timeout).map(Mutex::new))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            path = %settings.path.display(),
            readers = readers.len(),
            "request store opened"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(writer),
                readers,
                cursor: AtomicUsize::new(0),
            }),
            clock,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::Backend(format!("store task failed: {}", e)))?
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA synchronous = FULL;")?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

fn initialize_schema(conn: &mut Connection) -> Result<(), StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", [], |row| row.get(0))
        .optional()?;
    match version {
        None => {
            tx.execute_batch(SCHEMA)?;
            tx.execute(
                "INSERT INTO store_meta (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(SCHEMA_VERSION) => {}
        Some(other) => {
            return Err(StoreError::Backend(format!(
                "database schema version {} is not supported (expected {})",
                other, SCHEMA_VERSION
            )))
        }
    }
    tx.commit()?;
    Ok(())
}

fn sql_id(id: RequestId) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::Backend(format!("request id {} out of range", id)))
}

fn corrupt(id: RequestId, e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(format!("request {} is unreadable: {}", id, e))
}

/// Values of the indexed `requests` columns
struct Columns {
    status: String,
    user_id: String,
    username: String,
    created_ms: i64,
    end_ms: i64,
    deleted_ms: Option<i64>,
    applied_callbacks: String,
    body: String,
}

impl Columns {
    fn of(record: &RequestRecord) -> Result<Self, StoreError> {
        let request = &record.request;
        let json = |e: serde_json::Error| corrupt(request.id, e);
        Ok(Self {
            status: request.status.to_string(),
            user_id: request.user_id.clone(),
            username: request.username.clone(),
            created_ms: request.created_at.timestamp_millis(),
            end_ms: request.end_date.timestamp_millis(),
            deleted_ms: request.deleted_at.map(|t| t.timestamp_millis()),
            applied_callbacks: serde_json::to_string(&record.applied_callbacks).map_err(json)?,
            body: serde_json::to_string(request).map_err(json)?,
        })
    }
}

fn load(conn: &Connection, id: RequestId) -> Result<Option<(RequestRecord, i64)>, StoreError> {
    let found = conn
        .query_row(
            "SELECT version, applied_callbacks, body FROM requests WHERE id = ?1",
            params![sql_id(id)?],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((version, applied, body)) = found else {
        return Ok(None);
    };

    let mut request: Request = serde_json::from_str(&body).map_err(|e| corrupt(id, e))?;
    request.id = id;
    let applied_callbacks: Vec<String> =
        serde_json::from_str(&applied).map_err(|e| corrupt(id, e))?;

    let mut stmt = conn.prepare_cached(
        "SELECT namespace, group_id, group_name, approved, approver_id, approver_name
         FROM namespace_approvals WHERE request_id = ?1 ORDER BY position",
    )?;
    let namespace_approvals = stmt
        .query_map(params![sql_id(id)?], |row| {
            Ok(NamespaceApproval {
                request_id: id,
                namespace: row.get(0)?,
                group_id: row.get(1)?,
                group_name: row.get(2)?,
                approved: row.get(3)?,
                approver_id: row.get(4)?,
                approver_name: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some((
        RequestRecord {
            request,
            namespace_approvals,
            applied_callbacks,
        },
        version,
    )))
}

fn write_rows(conn: &Connection, record: &RequestRecord) -> Result<(), StoreError> {
    let id = sql_id(record.request.id)?;
    conn.execute(
        "DELETE FROM namespace_approvals WHERE request_id = ?1",
        params![id],
    )?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO namespace_approvals
         (request_id, position, namespace, group_id, group_name, approved, approver_id, approver_name)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for (position, row) in record.namespace_approvals.iter().enumerate() {
        stmt.execute(params![
            id,
            position as i64,
            row.namespace,
            row.group_id,
            row.group_name,
            row.approved,
            row.approver_id,
            row.approver_name,
        ])?;
    }
    Ok(())
}

fn insert(inner: &Inner, mut record: RequestRecord) -> Result<RequestRecord, StoreError> {
    let mut conn = inner.writer.lock();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let cols = Columns::of(&record)?;
    tx.execute(
        "INSERT INTO requests
         (status, user_id, username, created_ms, end_ms, deleted_ms, applied_callbacks, body)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}')",
        params![
            cols.status,
            cols.user_id,
            cols.username,
            cols.created_ms,
            cols.end_ms,
            cols.deleted_ms,
            cols.applied_callbacks,
        ],
    )?;
    let id = RequestId::try_from(tx.last_insert_rowid())
        .map_err(|_| StoreError::Backend("negative row id".to_string()))?;

    record.request.id = id;
    for row in &mut record.namespace_approvals {
        row.request_id = id;
    }
    let body = Columns::of(&record)?.body;
    tx.execute(
        "UPDATE requests SET body = ?1 WHERE id = ?2",
        params![body, sql_id(id)?],
    )?;
    write_rows(&tx, &record)?;
    tx.commit()?;
    Ok(record)
}

/// Write `record` if its row is still at `version`. Returns false on a lost race.
fn write_if_unchanged(inner: &Inner, record: &RequestRecord, version: i64) -> Result<bool, StoreError> {
    let mut conn = inner.writer.lock();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let cols = Columns::of(record)?;
    let written = tx.execute(
        "UPDATE requests SET version = version + 1, status = ?1, user_id = ?2, username = ?3,
         created_ms = ?4, end_ms = ?5, deleted_ms = ?6, applied_callbacks = ?7, body = ?8
         WHERE id = ?9 AND version = ?10",
        params![
            cols.status,
            cols.user_id,
            cols.username,
            cols.created_ms,
            cols.end_ms,
            cols.deleted_ms,
            cols.applied_callbacks,
            cols.body,
            sql_id(record.request.id)?,
            version,
        ],
    )?;
    if written == 0 {
        return Ok(false);
    }
    write_rows(&tx, record)?;
    tx.commit()?;
    Ok(true)
}

fn delete_expired(inner: &Inner, now_ms: i64) -> Result<Vec<RequestId>, StoreError> {
    let mut conn = inner.writer.lock();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let ids = {
        let mut stmt = tx.prepare(
            "SELECT id FROM requests WHERE status = 'Requested' AND end_ms < ?1 ORDER BY id",
        )?;
        let ids = stmt
            .query_map(params![now_ms], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };
    for id in &ids {
        tx.execute("DELETE FROM requests WHERE id = ?1", params![id])?;
    }
    tx.commit()?;
    ids.into_iter()
        .map(|id| {
            RequestId::try_from(id).map_err(|_| StoreError::Backend("negative row id".to_string()))
        })
        .collect()
}

fn list(inner: &Inner, filter: &RecordFilter) -> Result<Vec<RequestRecord>, StoreError> {
    let conn = inner.reader();
    let limit = filter
        .limit
        .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
        .unwrap_or(-1);
    let ids = {
        let mut stmt = conn.prepare_cached(
            "SELECT id FROM requests
             WHERE deleted_ms IS NULL
               AND (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR user_id = ?2)
               AND (?3 IS NULL OR username = ?3)
               AND (?4 IS NULL OR created_ms >= ?4)
               AND (?5 IS NULL OR created_ms <= ?5)
             ORDER BY id DESC
             LIMIT ?6",
        )?;
        let ids = stmt
            .query_map(
                params![
                    filter.status.map(|s| s.to_string()),
                    filter.user_id,
                    filter.username,
                    filter.created_after.map(|t| t.timestamp_millis()),
                    filter.created_before.map(|t| t.timestamp_millis()),
                    limit,
                ],
                |row| row.get::<_, i64>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };

    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        let id = RequestId::try_from(id)
            .map_err(|_| StoreError::Backend("negative row id".to_string()))?;
        if let Some((record, _)) = load(&conn, id)? {
            records.push(record);
        }
    }
    Ok(records)
}

#[async_trait]
impl RequestStore for SqliteStore {
    async fn insert(&self, mut record: RequestRecord) -> Result<RequestRecord, StoreError> {
        let now = self.clock.now();
        record.request.created_at = now;
        record.request.updated_at = now;
        record.refresh_fully_approved();
        self.blocking(move |inner| insert(inner, record)).await
    }

    async fn get(&self, id: RequestId) -> Result<Option<RequestRecord>, StoreError> {
        self.blocking(move |inner| Ok(load(&inner.reader(), id)?.map(|(record, _)| record)))
            .await
    }

    async fn modify(
        &self,
        id: RequestId,
        mutation: Mutation<'_>,
    ) -> Result<RequestRecord, StoreError> {
        for attempt in 1..=MAX_MODIFY_ATTEMPTS {
            let (current, version) = self
                .blocking(move |inner| load(&inner.writer.lock(), id))
                .await?
                .ok_or(StoreError::NotFound(id))?;

            let mut updated = current.clone();
            mutation(&mut updated)?;
            updated.refresh_fully_approved();
            if updated == current {
                return Ok(updated);
            }
            updated.request.updated_at = self.clock.now();

            let record = updated.clone();
            if self
                .blocking(move |inner| write_if_unchanged(inner, &record, version))
                .await?
            {
                return Ok(updated);
            }
            debug!(request_id = id, attempt, "request changed concurrently, reapplying");
        }
        Err(StoreError::Backend(format!(
            "request {} kept changing, gave up after {} attempts",
            id, MAX_MODIFY_ATTEMPTS
        )))
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<RequestId>, StoreError> {
        let now_ms = now.timestamp_millis();
        self.blocking(move |inner| delete_expired(inner, now_ms))
            .await
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<RequestRecord>, StoreError> {
        let filter = filter.clone();
        self.blocking(move |inner| list(inner, &filter)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestStatus;
    use crate::store::tests::{base_time, draft};
    use chrono::Duration as ChronoDuration;
    use kube_jit_common::clock::ManualClock;

    fn open(dir: &tempfile::TempDir, clock: &ManualClock) -> SqliteStore {
        let settings = SqliteSettings {
            read_pool_size: 2,
            ..SqliteSettings::new(dir.path().join("data").join("kube-jit.db"))
        };
        SqliteStore::open(&settings, Arc::new(clock.clone())).unwrap()
    }

    fn approve_all(rec: &mut RequestRecord) -> Result<(), StoreError> {
        for row in &mut rec.namespace_approvals {
            row.approved = true;
        }
        Ok(())
    }

    /// Story: requests and approvals survive an API restart
    #[tokio::test]
    async fn story_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(base_time());

        let store = open(&dir, &clock);
        let first = store
            .insert(draft(&[("app-a", "ga"), ("app-b", "gb")], base_time()))
            .await
            .unwrap();
        assert_eq!(first.request.id, 1);
        store
            .modify(1, &mut |rec: &mut RequestRecord| {
                rec.namespace_approvals[1].approved = true;
                rec.namespace_approvals[1].approver_id = Some("u2".into());
                rec.applied_callbacks.push("Pending".into());
                Ok(())
            })
            .await
            .unwrap();
        drop(store);

        let reopened = open(&dir, &clock);
        let record = reopened.get(1).await.unwrap().unwrap();
        assert_eq!(record.request.namespaces, vec!["app-a", "app-b"]);
        assert_eq!(record.namespace_approvals[0].namespace, "app-a");
        assert!(!record.namespace_approvals[0].approved);
        assert!(record.namespace_approvals[1].approved);
        assert_eq!(record.namespace_approvals[1].approver_id.as_deref(), Some("u2"));
        assert_eq!(record.applied_callbacks, vec!["Pending"]);

        let second = reopened
            .insert(draft(&[("app-a", "ga")], base_time()))
            .await
            .unwrap();
        assert_eq!(second.request.id, 2);
    }

    #[tokio::test]
    async fn failed_mutation_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(base_time());
        let store = open(&dir, &clock);
        store
            .insert(draft(&[("app-a", "ga")], base_time()))
            .await
            .unwrap();
        clock.advance(ChronoDuration::minutes(1));

        let result = store
            .modify(1, &mut |rec: &mut RequestRecord| {
                rec.request.status = RequestStatus::Approved;
                Err(StoreError::Rejected("no".into()))
            })
            .await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));

        let stored = store.get(1).await.unwrap().unwrap();
        assert_eq!(stored.request.status, RequestStatus::Requested);
        assert_eq!(stored.request.updated_at, base_time());
    }

    #[tokio::test]
    async fn modify_recomputes_fully_approved_and_stamps_update() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(base_time());
        let store = open(&dir, &clock);
        store
            .insert(draft(&[("app-a", "ga"), ("app-b", "gb")], base_time()))
            .await
            .unwrap();
        clock.advance(ChronoDuration::minutes(1));

        let updated = store.modify(1, &mut approve_all).await.unwrap();
        assert!(updated.request.fully_approved);
        let stored = store.get(1).await.unwrap().unwrap();
        assert_eq!(stored, updated);
        assert_eq!(stored.request.updated_at, base_time() + ChronoDuration::minutes(1));
    }

    #[tokio::test]
    async fn modify_missing_request_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, &ManualClock::new(base_time()));
        let err = store
            .modify(42, &mut |_: &mut RequestRecord| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(42)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_row_flips_are_all_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(open(&dir, &ManualClock::new(base_time())));
        let namespaces = [("n0", "g"), ("n1", "g"), ("n2", "g"), ("n3", "g")];
        store
            .insert(draft(&namespaces, base_time()))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..namespaces.len() {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .modify(1, &mut |rec: &mut RequestRecord| {
                        rec.namespace_approvals[i].approved = true;
                        Ok(())
                    })
                    .await
                    .map(|_| ())
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let record = store.get(1).await.unwrap().unwrap();
        assert!(record.namespace_approvals.iter().all(|r| r.approved));
        assert!(record.request.fully_approved);
    }

    #[tokio::test]
    async fn delete_expired_removes_stuck_requests_and_their_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, &ManualClock::new(base_time()));
        let past = base_time() - ChronoDuration::minutes(1);
        store.insert(draft(&[("a", "g")], past)).await.unwrap();
        store.insert(draft(&[("a", "g")], past)).await.unwrap();
        store
            .insert(draft(&[("a", "g")], base_time() + ChronoDuration::minutes(5)))
            .await
            .unwrap();
        store
            .modify(2, &mut |rec: &mut RequestRecord| {
                rec.request.status = RequestStatus::Approved;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(store.delete_expired(base_time()).await.unwrap(), vec![1]);
        assert!(store.get(1).await.unwrap().is_none());
        assert!(store.get(2).await.unwrap().is_some());
        assert!(store.get(3).await.unwrap().is_some());

        let orphans: i64 = store
            .inner
            .writer
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM namespace_approvals WHERE request_id = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn list_filters_newest_first_with_limit() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(base_time());
        let store = open(&dir, &clock);
        for user in ["u1", "u2", "u1"] {
            let mut record = draft(&[("a", "g")], base_time());
            record.request.user_id = user.into();
            store.insert(record).await.unwrap();
            clock.advance(ChronoDuration::minutes(1));
        }

        let ids = |records: Vec<RequestRecord>| -> Vec<RequestId> {
            records.into_iter().map(|r| r.request.id).collect()
        };
        assert_eq!(ids(store.list(&RecordFilter::default()).await.unwrap()), vec![3, 2, 1]);
        let mine = RecordFilter {
            user_id: Some("u1".into()),
            ..Default::default()
        };
        assert_eq!(ids(store.list(&mine).await.unwrap()), vec![3, 1]);
        let limited = RecordFilter {
            limit: Some(1),
            ..mine.clone()
        };
        assert_eq!(ids(store.list(&limited).await.unwrap()), vec![3]);
        let late = RecordFilter {
            created_after: Some(base_time() + ChronoDuration::minutes(1)),
            ..Default::default()
        };
        assert_eq!(ids(store.list(&late).await.unwrap()), vec![3, 2]);
    }
}
