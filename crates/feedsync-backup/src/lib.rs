//! Snapshot backups of the dedup store to object storage, and restore from the newest one.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use feedsync_core::SnapshotKey;
use feedsync_storage::{DedupStore, StoreError};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "feedsync-backup";

pub const DEFAULT_KEY_PREFIX: &str = "gitlabrsssync";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub key_prefix: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub interval: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            region: DEFAULT_REGION.to_string(),
            bucket: String::new(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            access_key: None,
            secret_key: None,
            interval: DEFAULT_INTERVAL,
        }
    }
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup not configured")]
    NotConfigured,
    #[error("backup manager busy: {0:?} in progress")]
    Busy(ManagerState),
    #[error("no backups found under prefix {prefix:?}")]
    NoBackups { prefix: String },
    #[error("bucket name is required when backups are enabled")]
    MissingBucket,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("object storage: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl BackupError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Where snapshots live: an object store plus the key prefix they are written under.
#[derive(Debug, Clone)]
pub struct BlobTarget {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    location: String,
}

impl BlobTarget {
    pub fn from_store(
        store: Arc<dyn ObjectStore>,
        prefix: &str,
        location: impl Into<String>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
            location: location.into(),
        }
    }

    /// S3 or an S3-compatible endpoint. Static keys win over ambient AWS credentials.
    pub fn s3(config: &BackupConfig) -> Result<Self, BackupError> {
        if config.bucket.trim().is_empty() {
            return Err(BackupError::MissingBucket);
        }

        let mut builder = AmazonS3Builder::from_env()
            .with_region(&config.region)
            .with_bucket_name(&config.bucket);

        if let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) {
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            builder = builder
                .with_access_key_id(access_key)
                .with_secret_access_key(secret_key);
        }

        let store = builder.build()?;
        Ok(Self::from_store(
            Arc::new(store),
            &config.key_prefix,
            format!("s3://{}", config.bucket),
        ))
    }

    pub fn local(root: &Path, prefix: &str) -> Result<Self, BackupError> {
        std::fs::create_dir_all(root)
            .map_err(|source| BackupError::io(format!("creating {}", root.display()), source))?;
        let store = LocalFileSystem::new_with_prefix(root)?;
        Ok(Self::from_store(
            Arc::new(store),
            prefix,
            format!("file://{}", root.display()),
        ))
    }

    pub fn in_memory(prefix: &str) -> Self {
        Self::from_store(Arc::new(InMemory::new()), prefix, "memory://")
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    fn describe(&self, key: &str) -> String {
        format!("{}/{}", self.location.trim_end_matches('/'), key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Disabled,
    Idle,
    Exporting,
    Restoring,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub key: String,
    pub taken_at: DateTime<Utc>,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub key: String,
    pub bytes: u64,
    pub rows: u64,
}

/// Periodic snapshot/upload of the dedup store, plus explicit restore.
///
/// Exporting and restoring are mutually exclusive; a request made while the other is in
/// flight fails with [`BackupError::Busy`] instead of queueing.
#[derive(Debug)]
pub struct BackupManager {
    store: Arc<DedupStore>,
    target: Option<BlobTarget>,
    interval: Duration,
    state: Mutex<ManagerState>,
}

impl BackupManager {
    pub fn disabled(store: Arc<DedupStore>) -> Self {
        Self {
            store,
            target: None,
            interval: Duration::ZERO,
            state: Mutex::new(ManagerState::Disabled),
        }
    }

    pub fn new(store: Arc<DedupStore>, target: BlobTarget, interval: Duration) -> Self {
        Self {
            store,
            target: Some(target),
            interval,
            state: Mutex::new(ManagerState::Idle),
        }
    }

    pub fn from_config(store: Arc<DedupStore>, config: &BackupConfig) -> Result<Self, BackupError> {
        if !config.enabled {
            return Ok(Self::disabled(store));
        }
        let target = BlobTarget::s3(config)?;
        Ok(Self::new(store, target, config.interval))
    }

    pub fn state(&self) -> ManagerState {
        *self.lock_state()
    }

    pub fn is_enabled(&self) -> bool {
        self.state() != ManagerState::Disabled
    }

    /// Snapshot the store and upload it as `<prefix>/<timestamp>.db`.
    pub async fn backup(&self) -> Result<SnapshotInfo, BackupError> {
        let _exporting = self.begin(ManagerState::Exporting)?;
        let target = self.target()?;

        let scratch = tempfile::Builder::new()
            .prefix("sqlite-backup-")
            .tempdir()
            .map_err(|source| BackupError::io("creating backup scratch directory", source))?;
        let scratch_file = scratch.path().join("backup.db");

        self.store.export_to(&scratch_file).await?;
        let bytes = fs::read(&scratch_file).await.map_err(|source| {
            BackupError::io(format!("reading {}", scratch_file.display()), source)
        })?;
        let size = bytes.len() as u64;
        let sha256 = sha256_hex(&bytes);

        let key = SnapshotKey::new(target.prefix(), Utc::now());
        let object_key = key.object_key();
        target
            .store
            .put(&ObjectPath::from(object_key.as_str()), PutPayload::from(bytes))
            .await?;

        info!(
            destination = %target.describe(&object_key),
            bytes = size,
            sha256 = %sha256,
            "backed up dedup store"
        );

        Ok(SnapshotInfo {
            key: object_key,
            taken_at: key.taken_at(),
            bytes: size,
            sha256,
        })
    }

    /// Snapshots under the prefix, newest first. Objects whose key is not a
    /// `<prefix>/<timestamp>.db` snapshot name are left out.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotEntry>, BackupError> {
        let target = self.target()?;
        let prefix = ObjectPath::from(target.prefix());
        let listing = if target.prefix().is_empty() {
            target.store.list(None)
        } else {
            target.store.list(Some(&prefix))
        };
        let objects: Vec<ObjectMeta> = listing.try_collect().await?;

        let mut snapshots: Vec<(SnapshotKey, ObjectMeta)> = objects
            .into_iter()
            .filter_map(|meta| {
                let key = SnapshotKey::parse(meta.location.as_ref())?;
                if key.prefix() != target.prefix() {
                    return None;
                }
                Some((key, meta))
            })
            .collect();
        snapshots.sort_by(|(ka, a), (kb, b)| {
            b.last_modified.cmp(&a.last_modified).then_with(|| kb.cmp(ka))
        });

        Ok(snapshots
            .into_iter()
            .map(|(_, meta)| SnapshotEntry {
                key: meta.location.to_string(),
                last_modified: meta.last_modified,
                bytes: meta.size as u64,
            })
            .collect())
    }

    /// Replace the live store with the newest snapshot. Never falls back to an empty
    /// store: every failure is returned to the caller.
    pub async fn restore(&self) -> Result<RestoreReport, BackupError> {
        let _restoring = self.begin(ManagerState::Restoring)?;
        let target = self.target()?;

        let latest = self
            .list_snapshots()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackupError::NoBackups {
                prefix: target.prefix().to_string(),
            })?;

        let content = target
            .store
            .get(&ObjectPath::from(latest.key.as_str()))
            .await?
            .bytes()
            .await?;

        let scratch = tempfile::Builder::new()
            .prefix("sqlite-restore-")
            .tempdir()
            .map_err(|source| BackupError::io("creating restore scratch directory", source))?;
        let scratch_file = scratch.path().join("restore.db");
        fs::write(&scratch_file, &content).await.map_err(|source| {
            BackupError::io(format!("writing {}", scratch_file.display()), source)
        })?;

        let rows = self.store.replace_with(&scratch_file).await?;
        info!(
            source = %target.describe(&latest.key),
            rows,
            "restored dedup store from backup"
        );

        Ok(RestoreReport {
            key: latest.key,
            bytes: content.len() as u64,
            rows,
        })
    }

    /// One immediate backup, then one per interval until `cancel` fires. Failures are
    /// logged and the loop carries on.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.is_enabled() {
            info!("backups disabled");
            return;
        }
        if self.interval.is_zero() {
            info!("backup interval not set; scheduled backups disabled");
            return;
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("backup loop stopped before initial backup completed");
                return;
            }
            res = self.backup() => {
                if let Err(err) = res {
                    warn!(error = %err, "initial backup failed");
                }
            }
        }

        let Some(first_tick) = Instant::now().checked_add(self.interval) else {
            warn!(
                interval = ?self.interval,
                "backup interval too large; scheduled backups disabled"
            );
            return;
        };
        let mut ticker = tokio::time::interval_at(first_tick, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        res = self.backup() => {
                            if let Err(err) = res {
                                warn!(error = %err, "scheduled backup failed");
                            }
                        }
                    }
                }
            }
        }
        info!("backup loop stopped");
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let span = info_span!("backup_loop", interval = ?self.interval);
        tokio::spawn(Arc::clone(self).run(cancel).instrument(span))
    }

    fn target(&self) -> Result<&BlobTarget, BackupError> {
        self.target.as_ref().ok_or(BackupError::NotConfigured)
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin(&self, next: ManagerState) -> Result<StateGuard<'_>, BackupError> {
        let mut state = self.lock_state();
        match *state {
            ManagerState::Disabled => Err(BackupError::NotConfigured),
            ManagerState::Idle => {
                *state = next;
                Ok(StateGuard { manager: self })
            }
            busy => Err(BackupError::Busy(busy)),
        }
    }
}

/// Returns the manager to `Idle` on every exit path, including cancellation.
struct StateGuard<'a> {
    manager: &'a BackupManager,
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        *self.manager.lock_state() = ManagerState::Idle;
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
