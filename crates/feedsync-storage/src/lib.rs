//! Durable seen-item store (embedded SQLite file) and the set-command shim the
//! reconciliation engine and health endpoint talk to.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_core::SeenItem;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "feedsync-storage";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS feed_items (
    feed_id TEXT NOT NULL,
    guid TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (feed_id, guid)
);
CREATE INDEX IF NOT EXISTS idx_feed_items_feed_id ON feed_items(feed_id);
"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store is closed")]
    Closed,
    #[error("integrity check failed: {0}")]
    Corrupt(String),
    #[error("in-memory set lock poisoned")]
    Poisoned,
}

impl StoreError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// The `(feed_id, guid)` membership relation persisted in a single SQLite file.
///
/// One pooled connection serializes every statement, so callers never lock externally.
/// The pool sits behind an async `RwLock`: ordinary reads and writes share it, while
/// export and restore take it exclusively so nothing lands mid-copy.
#[derive(Debug)]
pub struct DedupStore {
    path: PathBuf,
    pool: RwLock<SqlitePool>,
}

impl DedupStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|source| {
                StoreError::io(format!("creating database directory {}", parent.display()), source)
            })?;
        }

        let pool = connect(&path, true).await?;
        migrate(&pool).await?;
        info!(path = %path.display(), "opened dedup store");

        Ok(Self {
            path,
            pool: RwLock::new(pool),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn is_member(&self, feed_id: &str, guid: &str) -> Result<bool, StoreError> {
        let pool = self.pool.read().await;
        ensure_open(&pool)?;
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM feed_items WHERE feed_id = ? AND guid = ?)",
        )
        .bind(feed_id)
        .bind(guid)
        .fetch_one(&*pool)
        .await?;
        Ok(exists != 0)
    }

    /// Idempotent insert. Returns `true` when the pair was not present before.
    pub async fn add(&self, feed_id: &str, guid: &str) -> Result<bool, StoreError> {
        let pool = self.pool.read().await;
        ensure_open(&pool)?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO feed_items (feed_id, guid, created_at) VALUES (?, ?, ?)",
        )
        .bind(feed_id)
        .bind(guid)
        .bind(Utc::now())
        .execute(&*pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Connectivity plus a quick structural check of the file on disk. The check runs
    /// on a fresh connection, so a file deleted or replaced under the live pool fails.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let pool = self.pool.read().await;
        ensure_open(&pool)?;

        let present = fs::try_exists(&self.path).await.map_err(|source| {
            StoreError::io(format!("checking {}", self.path.display()), source)
        })?;
        if !present {
            return Err(StoreError::Corrupt(format!("{} is missing", self.path.display())));
        }

        let fresh = connect(&self.path, false)
            .await
            .map_err(|err| StoreError::Corrupt(format!("{}: {err}", self.path.display())))?;
        let checked: Result<String, sqlx::Error> = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_one(&fresh)
            .await;
        fresh.close().await;

        let verdict =
            checked.map_err(|err| StoreError::Corrupt(format!("{}: {err}", self.path.display())))?;
        if verdict.eq_ignore_ascii_case("ok") {
            Ok(())
        } else {
            Err(StoreError::Corrupt(verdict))
        }
    }

    pub async fn close(&self) {
        let pool = self.pool.read().await;
        if !pool.is_closed() {
            pool.close().await;
            info!(path = %self.path.display(), "closed dedup store");
        }
    }

    pub async fn seen_count(&self) -> Result<u64, StoreError> {
        let pool = self.pool.read().await;
        ensure_open(&pool)?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feed_items")
            .fetch_one(&*pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    pub async fn seen_items(&self, feed_id: &str) -> Result<Vec<SeenItem>, StoreError> {
        let pool = self.pool.read().await;
        ensure_open(&pool)?;
        let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT feed_id, guid, created_at FROM feed_items \
             WHERE feed_id = ? ORDER BY created_at, guid",
        )
        .bind(feed_id)
        .fetch_all(&*pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(feed_id, guid, recorded_at)| SeenItem {
                feed_id,
                guid,
                recorded_at,
            })
            .collect())
    }

    /// Flush the write-ahead log into the primary file.
    pub async fn checkpoint(&self) -> Result<(), StoreError> {
        let pool = self.pool.read().await;
        ensure_open(&pool)?;
        checkpoint_pool(&pool).await
    }

    /// Copy the primary file verbatim to `dest`, checkpointing first. A failed
    /// checkpoint only means the copy may lag the log, so it is logged and ignored.
    pub async fn export_to(&self, dest: &Path) -> Result<u64, StoreError> {
        let pool = self.pool.write().await;
        ensure_open(&pool)?;

        if let Err(err) = checkpoint_pool(&pool).await {
            warn!(error = %err, "checkpoint before export failed; snapshot may be stale");
        }

        let bytes = fs::copy(&self.path, dest).await.map_err(|source| {
            StoreError::io(
                format!("copying {} -> {}", self.path.display(), dest.display()),
                source,
            )
        })?;
        debug!(dest = %dest.display(), bytes, "exported dedup store");
        Ok(bytes)
    }

    /// Replace the live file with `candidate` and reopen. The candidate is validated
    /// first; a file that is not a readable store leaves the live store untouched.
    /// Returns the number of rows in the restored store.
    pub async fn replace_with(&self, candidate: &Path) -> Result<u64, StoreError> {
        let rows = validate_candidate(candidate).await?;

        let mut pool = self.pool.write().await;
        pool.close().await;

        match self.swap_in(candidate).await {
            Ok(reopened) => {
                *pool = reopened;
                info!(path = %self.path.display(), rows, "replaced dedup store contents");
                Ok(rows)
            }
            Err(err) => {
                warn!(error = %err, "restore swap failed; reopening existing file");
                match connect(&self.path, true).await {
                    Ok(previous) => *pool = previous,
                    Err(reopen_err) => {
                        warn!(
                            error = %reopen_err,
                            "could not reopen dedup store after failed restore"
                        )
                    }
                }
                Err(err)
            }
        }
    }

    async fn swap_in(&self, candidate: &Path) -> Result<SqlitePool, StoreError> {
        for side in side_files(&self.path) {
            match fs::remove_file(&side).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(StoreError::io(
                        format!("removing stale {}", side.display()),
                        source,
                    ))
                }
            }
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store.db".to_string());
        let staging = self.path.with_file_name(format!(".{file_name}.restore.tmp"));

        fs::copy(candidate, &staging).await.map_err(|source| {
            StoreError::io(
                format!("staging {} -> {}", candidate.display(), staging.display()),
                source,
            )
        })?;
        if let Err(source) = fs::rename(&staging, &self.path).await {
            let _ = fs::remove_file(&staging).await;
            return Err(StoreError::io(
                format!("renaming {} -> {}", staging.display(), self.path.display()),
                source,
            ));
        }

        let pool = connect(&self.path, false).await?;
        migrate(&pool).await?;
        Ok(pool)
    }
}

async fn connect(path: &Path, create: bool) -> Result<SqlitePool, StoreError> {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}

fn ensure_open(pool: &SqlitePool) -> Result<(), StoreError> {
    if pool.is_closed() {
        Err(StoreError::Closed)
    } else {
        Ok(())
    }
}

async fn checkpoint_pool(pool: &SqlitePool) -> Result<(), StoreError> {
    let (busy, log_frames, checkpointed): (i64, i64, i64) =
        sqlx::query_as("PRAGMA wal_checkpoint(FULL)")
            .fetch_one(pool)
            .await?;
    if busy != 0 {
        warn!(log_frames, checkpointed, "wal checkpoint could not complete");
    } else {
        debug!(log_frames, checkpointed, "wal checkpoint complete");
    }
    Ok(())
}

async fn validate_candidate(candidate: &Path) -> Result<u64, StoreError> {
    let pool = connect(candidate, false)
        .await
        .map_err(|err| StoreError::Corrupt(format!("{}: {err}", candidate.display())))?;
    let checked: Result<i64, sqlx::Error> = sqlx::query_scalar("SELECT COUNT(*) FROM feed_items")
        .fetch_one(&pool)
        .await;
    pool.close().await;
    let rows =
        checked.map_err(|err| StoreError::Corrupt(format!("{}: {err}", candidate.display())))?;
    Ok(u64::try_from(rows).unwrap_or_default())
}

fn side_files(path: &Path) -> [PathBuf; 2] {
    let base = path.as_os_str().to_os_string();
    let mut wal = base.clone();
    wal.push("-wal");
    let mut shm = base;
    shm.push("-shm");
    [PathBuf::from(wal), PathBuf::from(shm)]
}

/// Storage-agnostic set operations behind the [`SetClient`] command surface.
#[async_trait]
pub trait SetBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    /// Returns `true` when `member` was newly added.
    async fn add(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl SetBackend for DedupStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        DedupStore::is_member(self, key, member).await
    }

    async fn add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        DedupStore::add(self, key, member).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        DedupStore::ping(self).await
    }
}

/// Process-local cache variant. Nothing survives a restart; useful for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemorySet {
    sets: StdRwLock<HashMap<String, HashSet<String>>>,
}

impl MemorySet {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SetBackend for MemorySet {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let sets = self.sets.read().map_err(|_| StoreError::Poisoned)?;
        Ok(sets.get(key).is_some_and(|set| set.contains(member)))
    }

    async fn add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut sets = self.sets.write().map_err(|_| StoreError::Poisoned)?;
        Ok(sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _sets = self.sets.read().map_err(|_| StoreError::Poisoned)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SetError {
    #[error("{command} failed: {source}")]
    Backend {
        command: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("{command} cancelled")]
    Cancelled { command: &'static str },
    #[error("{command} timed out after {after:?}")]
    TimedOut {
        command: &'static str,
        after: Duration,
    },
}

/// Completed command: a value plus the error, if any, that accompanied it.
#[derive(Debug)]
pub struct Reply<T> {
    value: T,
    error: Option<SetError>,
}

impl<T> Reply<T> {
    fn ok(value: T) -> Self {
        Self { value, error: None }
    }

    fn failed(value: T, error: SetError) -> Self {
        Self {
            value,
            error: Some(error),
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn err(&self) -> Option<&SetError> {
        self.error.as_ref()
    }

    pub fn into_result(self) -> Result<T, SetError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.value),
        }
    }
}

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Cache-style command surface (`sismember`, `sadd`, `ping`) over any [`SetBackend`].
/// Every command is bounded by a timeout and by the client's cancellation token.
#[derive(Clone)]
pub struct SetClient {
    backend: Arc<dyn SetBackend>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl SetClient {
    pub fn new(backend: Arc<dyn SetBackend>) -> Self {
        Self {
            backend,
            timeout: DEFAULT_COMMAND_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub async fn sismember(&self, key: &str, member: &str) -> Reply<bool> {
        match self.run("sismember", self.backend.is_member(key, member)).await {
            Ok(found) => Reply::ok(found),
            Err(err) => Reply::failed(false, err),
        }
    }

    /// Adds each member in turn. Failures do not stop later members; the count covers
    /// newly added members and the last failure is reported alongside it.
    pub async fn sadd(&self, key: &str, members: &[&str]) -> Reply<u64> {
        let mut added = 0u64;
        let mut last_error = None;
        for member in members {
            match self.run("sadd", self.backend.add(key, member)).await {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(key, member, error = %err, "sadd member failed");
                    last_error = Some(err);
                }
            }
        }
        match last_error {
            Some(err) => Reply::failed(added, err),
            None => Reply::ok(added),
        }
    }

    pub async fn ping(&self) -> Reply<String> {
        match self.run("ping", self.backend.ping()).await {
            Ok(()) => Reply::ok("PONG".to_string()),
            Err(err) => Reply::failed(String::new(), err),
        }
    }

    async fn run<T, F>(&self, command: &'static str, fut: F) -> Result<T, SetError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SetError::Cancelled { command }),
            res = tokio::time::timeout(self.timeout, fut) => match res {
                Ok(inner) => inner.map_err(|source| SetError::Backend { command, source }),
                Err(_) => Err(SetError::TimedOut { command, after: self.timeout }),
            },
        }
    }
}
