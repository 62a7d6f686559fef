//! Reconciliation of feed items against the dedup store and the issue tracker, the
//! poll loop that drives it, configuration loading and instance metrics.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use feedsync_adapters::{FeedError, FeedSource, IssueTracker};
use feedsync_backup::{BackupConfig, DEFAULT_INTERVAL, DEFAULT_KEY_PREFIX, DEFAULT_REGION};
use feedsync_core::{Decision, FeedItem, FeedRecord};
use feedsync_storage::SetClient;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "feedsync-sync";

pub const CONFIG_FILE_NAME: &str = "config.yaml";
pub const DB_FILE_NAME: &str = "gitlabrsssync.db";
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8080";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(600);
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 20;
/// Longest interval `parse_interval` accepts.
pub const MAX_INTERVAL: Duration = Duration::from_secs(366 * 24 * 60 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidVar {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("feed id {0:?} is configured more than once")]
    DuplicateFeed(String),
}

/// Process settings read from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub tracker_base_url: String,
    pub tracker_token: String,
    pub config_dir: PathBuf,
    pub db_path: PathBuf,
    pub listen_address: String,
    pub backup: BackupConfig,
    pub restore_on_start: bool,
    pub http_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &'static str| var(name).ok_or(ConfigError::MissingVar(name));

        let tracker_base_url = required("GITLAB_API_BASE_URL")?;
        let tracker_token = required("GITLAB_API_TOKEN")?;
        let config_dir = PathBuf::from(required("CONFIG_DIR")?);
        let db_path = var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir.join(DB_FILE_NAME));

        let enabled = var("S3_ENABLED").map(|v| parse_flag(&v)).unwrap_or(false);
        let bucket = var("S3_BUCKET_NAME").unwrap_or_default();
        if enabled && bucket.is_empty() {
            return Err(ConfigError::MissingVar("S3_BUCKET_NAME"));
        }
        let interval = match var("S3_BACKUP_INTERVAL") {
            None => DEFAULT_INTERVAL,
            Some(raw) => parse_interval(&raw).unwrap_or_else(|| {
                warn!(
                    value = %raw,
                    default_secs = DEFAULT_INTERVAL.as_secs(),
                    "invalid S3_BACKUP_INTERVAL, using default"
                );
                DEFAULT_INTERVAL
            }),
        };
        let backup = BackupConfig {
            enabled,
            endpoint: var("S3_ENDPOINT"),
            region: var("S3_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string()),
            bucket,
            key_prefix: var("S3_KEY_PREFIX").unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            access_key: var("S3_ACCESS_KEY"),
            secret_key: var("S3_SECRET_KEY"),
            interval,
        };

        let http_timeout_secs = match var("HTTP_TIMEOUT_SECS") {
            None => DEFAULT_HTTP_TIMEOUT_SECS,
            Some(raw) => raw.trim().parse().map_err(|err: std::num::ParseIntError| {
                ConfigError::InvalidVar {
                    name: "HTTP_TIMEOUT_SECS",
                    value: raw.clone(),
                    reason: err.to_string(),
                }
            })?,
        };

        Ok(Self {
            tracker_base_url,
            tracker_token,
            config_dir,
            db_path,
            listen_address: var("LISTEN_ADDRESS")
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_string()),
            backup,
            restore_on_start: var("RESTORE_ON_START").map(|v| parse_flag(&v)).unwrap_or(false),
            http_timeout: Duration::from_secs(http_timeout_secs),
        })
    }

    pub fn feeds_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE_NAME)
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

/// Parse `90s`, `15m`, `6h`, `1d` or bare seconds. Zero, malformed input and anything
/// above [`MAX_INTERVAL`] yield `None`.
pub fn parse_interval(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    let scale = match unit.trim() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        _ => return None,
    };
    let secs = amount.checked_mul(scale)?;
    let interval = Duration::from_secs(secs);
    (secs > 0 && interval <= MAX_INTERVAL).then_some(interval)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FeedsFile {
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default)]
    feeds: Vec<FeedRecord>,
}

/// The contents of `config.yaml`: the poll interval and the configured feeds.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub feeds: Vec<FeedRecord>,
}

impl SyncSettings {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml_str(&raw).map_err(|err| match err {
            ConfigError::Yaml { source, .. } => ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: FeedsFile = serde_yaml::from_str(raw).map_err(|source| ConfigError::Yaml {
            path: PathBuf::from(CONFIG_FILE_NAME),
            source,
        })?;

        let mut ids = HashSet::new();
        for feed in &file.feeds {
            if !ids.insert(feed.id.as_str()) {
                return Err(ConfigError::DuplicateFeed(feed.id.clone()));
            }
        }

        let poll_interval = match file.interval {
            Some(secs) if secs > 0 => Duration::from_secs(secs.unsigned_abs()),
            other => {
                warn!(
                    configured = ?other,
                    default_secs = DEFAULT_POLL_INTERVAL.as_secs(),
                    "poll interval missing or not positive, using default"
                );
                DEFAULT_POLL_INTERVAL
            }
        };

        Ok(Self {
            poll_interval,
            feeds: file.feeds,
        })
    }
}

/// Counters and the last-run gauge, owned by the engine and shared with the metrics endpoint.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    issues_created: AtomicU64,
    creation_errors: AtomicU64,
    last_run: AtomicI64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_created(&self) {
        self.issues_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_creation_error(&self) {
        self.creation_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_run(&self, at: DateTime<Utc>) {
        self.last_run.store(at.timestamp(), Ordering::Relaxed);
    }

    pub fn issues_created(&self) -> u64 {
        self.issues_created.load(Ordering::Relaxed)
    }

    pub fn creation_errors(&self) -> u64 {
        self.creation_errors.load(Ordering::Relaxed)
    }

    /// Unix seconds of the last completed poll cycle, 0 before the first one.
    pub fn last_run(&self) -> i64 {
        self.last_run.load(Ordering::Relaxed)
    }

    /// Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, kind, help, value) in [
            (
                "issue_creation_total",
                "counter",
                "The total number of issues created in the tracker",
                self.issues_created().to_string(),
            ),
            (
                "issue_creation_error_total",
                "counter",
                "The total number of failures creating issues in the tracker",
                self.creation_errors().to_string(),
            ),
            (
                "last_run_time",
                "gauge",
                "Last time a poll cycle completed, in Unix seconds",
                self.last_run().to_string(),
            ),
        ] {
            out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"));
        }
        out
    }
}

/// Decision counts for one feed in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedReport {
    pub feed_id: String,
    pub fetched: usize,
    pub created: usize,
    pub already_seen: usize,
    pub too_old: usize,
    pub remote_duplicates: usize,
    pub unclassifiable: usize,
    pub failed: usize,
}

impl FeedReport {
    pub fn new(feed_id: &str) -> Self {
        Self {
            feed_id: feed_id.to_string(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, decision: Decision) {
        let slot = match decision {
            Decision::AlreadySeen => &mut self.already_seen,
            Decision::Unclassifiable => &mut self.unclassifiable,
            Decision::TooOld => &mut self.too_old,
            Decision::RemoteDuplicate => &mut self.remote_duplicates,
            Decision::Created => &mut self.created,
            Decision::Failed => &mut self.failed,
        };
        *slot += 1;
    }
}

#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub reports: Vec<FeedReport>,
    pub failed_feeds: Vec<String>,
    pub interrupted: bool,
}

/// Decides, per item, between already seen, too old, remote duplicate and create.
#[derive(Clone)]
pub struct Reconciler {
    set: SetClient,
    source: Arc<dyn FeedSource>,
    tracker: Arc<dyn IssueTracker>,
    metrics: Arc<SyncMetrics>,
}

impl Reconciler {
    pub fn new(
        set: SetClient,
        source: Arc<dyn FeedSource>,
        tracker: Arc<dyn IssueTracker>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            set,
            source,
            tracker,
            metrics,
        }
    }

    pub fn metrics(&self) -> Arc<SyncMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Fetch a feed and reconcile its items in feed order.
    pub async fn check_feed(&self, feed: &FeedRecord) -> Result<FeedReport, FeedError> {
        let items = self.source.fetch_items(&feed.feed_url).await?;
        let mut report = FeedReport::new(&feed.id);
        report.fetched = items.len();
        for item in &items {
            let decision = self.reconcile_item(feed, item, Utc::now()).await;
            debug!(
                feed = %feed.id,
                guid = %item.guid,
                decision = decision.as_str(),
                "item reconciled"
            );
            report.record(decision);
        }
        Ok(report)
    }

    /// Local membership, then the cutoff, then the tracker search, then creation.
    /// Nothing is recorded on failure so the item is retried next cycle.
    pub async fn reconcile_item(
        &self,
        feed: &FeedRecord,
        item: &FeedItem,
        now: DateTime<Utc>,
    ) -> Decision {
        let name = feed.display_name();

        match self.set.sismember(&feed.id, &item.guid).await.into_result() {
            Ok(true) => return Decision::AlreadySeen,
            Ok(false) => {}
            Err(err) => {
                error!(
                    feed = name,
                    guid = %item.guid,
                    title = %item.title,
                    error = %err,
                    "membership check failed"
                );
                return Decision::Failed;
            }
        }

        let Some(item_time) = item.effective_timestamp() else {
            warn!(
                feed = name,
                guid = %item.guid,
                title = %item.title,
                "item has no updated or published time, skipping"
            );
            return Decision::Unclassifiable;
        };

        if feed.predates_cutoff(item_time) {
            debug!(feed = name, guid = %item.guid, %item_time, "item predates cutoff");
            return self.mark_seen(feed, item, Decision::TooOld).await;
        }

        let matches = match self.tracker.search(feed.tracker_project_id, &item.guid).await {
            Ok(matches) => matches,
            Err(err) => {
                warn!(
                    feed = name,
                    guid = %item.guid,
                    title = %item.title,
                    error = %err,
                    "issue search failed, skipping item"
                );
                return Decision::Failed;
            }
        };
        if !matches.is_empty() {
            if matches.len() > 1 {
                warn!(
                    feed = name,
                    guid = %item.guid,
                    matches = matches.len(),
                    "more than one issue carries this guid"
                );
            }
            info!(
                feed = name,
                guid = %item.guid,
                url = %matches[0].url,
                "issue already exists, marking seen"
            );
            return self.mark_seen(feed, item, Decision::RemoteDuplicate).await;
        }

        let issue = feed.new_issue(item, item_time, now);
        let created = match self.tracker.create_issue(feed.tracker_project_id, &issue).await {
            Ok(created) => created,
            Err(err) => {
                self.metrics.record_creation_error();
                error!(
                    feed = name,
                    guid = %item.guid,
                    title = %item.title,
                    error = %err,
                    "issue creation failed"
                );
                return Decision::Failed;
            }
        };

        // Only a recorded issue counts as created; an unrecorded one is retried next cycle.
        if let Err(err) = self.set.sadd(&feed.id, &[item.guid.as_str()]).await.into_result() {
            error!(
                feed = name,
                guid = %item.guid,
                title = %item.title,
                url = %created.url,
                error = %err,
                "issue created but not recorded locally"
            );
            return Decision::Failed;
        }
        self.metrics.record_created();
        info!(
            feed = name,
            guid = %item.guid,
            title = %item.title,
            issue_id = created.id,
            url = %created.url,
            "created issue"
        );
        Decision::Created
    }

    async fn mark_seen(&self, feed: &FeedRecord, item: &FeedItem, decision: Decision) -> Decision {
        match self.set.sadd(&feed.id, &[item.guid.as_str()]).await.into_result() {
            Ok(_) => decision,
            Err(err) => {
                error!(
                    feed = feed.display_name(),
                    guid = %item.guid,
                    title = %item.title,
                    error = %err,
                    "recording item failed"
                );
                Decision::Failed
            }
        }
    }
}

/// The foreground loop: every feed in sequence, then sleep for the poll interval.
#[derive(Clone)]
pub struct Poller {
    reconciler: Reconciler,
    settings: SyncSettings,
}

impl Poller {
    pub fn new(reconciler: Reconciler, settings: SyncSettings) -> Self {
        Self {
            reconciler,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// One pass over every feed. Cancellation is observed between feeds only.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("poll_cycle", %run_id, feeds = self.settings.feeds.len());
        async {
            let mut summary = CycleSummary {
                run_id,
                ..CycleSummary::default()
            };
            for feed in &self.settings.feeds {
                if cancel.is_cancelled() {
                    summary.interrupted = true;
                    break;
                }
                match self.reconciler.check_feed(feed).await {
                    Ok(report) => {
                        info!(
                            feed = feed.display_name(),
                            new = report.created,
                            already_seen = report.already_seen + report.remote_duplicates,
                            too_old = report.too_old,
                            failed = report.failed,
                            "Checked feed: {}, new: {}, already seen: {}",
                            feed.display_name(),
                            report.created,
                            report.already_seen + report.remote_duplicates
                        );
                        summary.reports.push(report);
                    }
                    Err(err) => {
                        warn!(
                            feed = feed.display_name(),
                            url = %feed.feed_url,
                            error = %err,
                            "feed fetch failed, skipping"
                        );
                        summary.failed_feeds.push(feed.id.clone());
                    }
                }
            }
            if !summary.interrupted {
                self.reconciler.metrics.mark_run(Utc::now());
            }
            summary
        }
        .instrument(span)
        .await
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.settings.poll_interval.as_secs(), "poll loop started");
        loop {
            self.run_cycle(&cancel).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        info!("poll loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use feedsync_adapters::{HttpError, TrackerError};
    use feedsync_core::{CreatedIssue, IssueMatch, NewIssue};
    use feedsync_storage::{MemorySet, SetBackend, StoreError};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
    }

    #[derive(Default)]
    struct FakeTracker {
        existing: Mutex<HashMap<String, usize>>,
        searches: Mutex<Vec<String>>,
        created: Mutex<Vec<(u64, NewIssue)>>,
        fail_search: bool,
        fail_create: bool,
    }

    fn tracker_failure() -> TrackerError {
        TrackerError::Http(HttpError::Status {
            status: 502,
            url: "http://tracker".into(),
            body: String::new(),
        })
    }

    #[async_trait]
    impl IssueTracker for FakeTracker {
        async fn search(
            &self,
            _project_id: u64,
            token: &str,
        ) -> Result<Vec<IssueMatch>, TrackerError> {
            self.searches.lock().expect("lock").push(token.to_string());
            if self.fail_search {
                return Err(tracker_failure());
            }
            let hits = self.existing.lock().expect("lock").get(token).copied().unwrap_or(0);
            Ok((0..hits)
                .map(|n| IssueMatch { url: format!("http://tracker/issues/{n}") })
                .collect())
        }

        async fn create_issue(
            &self,
            project_id: u64,
            issue: &NewIssue,
        ) -> Result<CreatedIssue, TrackerError> {
            if self.fail_create {
                return Err(tracker_failure());
            }
            let mut created = self.created.lock().expect("lock");
            created.push((project_id, issue.clone()));
            Ok(CreatedIssue {
                id: created.len() as u64,
                url: format!("http://tracker/issues/new/{}", created.len()),
            })
        }
    }

    #[derive(Default)]
    struct FakeSource {
        feeds: HashMap<String, Vec<FeedItem>>,
    }

    #[async_trait]
    impl FeedSource for FakeSource {
        async fn fetch_items(&self, url: &str) -> Result<Vec<FeedItem>, FeedError> {
            self.feeds.get(url).cloned().ok_or_else(|| FeedError::Parse {
                rss: "not found".into(),
                atom: "not found".into(),
            })
        }
    }

    fn feed(id: &str) -> FeedRecord {
        FeedRecord {
            id: id.into(),
            name: String::new(),
            feed_url: format!("https://example.com/{id}.xml"),
            tracker_project_id: 42,
            labels: vec!["security".into()],
            added_since: ts("2024-01-01T00:00:00Z"),
            retroactive: false,
        }
    }

    fn item(guid: &str, updated: Option<&str>) -> FeedItem {
        FeedItem {
            guid: guid.into(),
            title: format!("title {guid}"),
            description: "desc".into(),
            link: format!("https://example.com/{guid}"),
            updated_at: updated.map(ts),
            ..FeedItem::default()
        }
    }

    fn reconciler(tracker: Arc<FakeTracker>, source: FakeSource) -> (Reconciler, SetClient) {
        let set = SetClient::new(Arc::new(MemorySet::new()));
        let rec = Reconciler::new(
            set.clone(),
            Arc::new(source),
            tracker,
            Arc::new(SyncMetrics::new()),
        );
        (rec, set)
    }

    #[tokio::test]
    async fn already_seen_items_skip_remote_calls() {
        let tracker = Arc::new(FakeTracker::default());
        let (rec, set) = reconciler(Arc::clone(&tracker), FakeSource::default());
        set.sadd("f", &["g1"]).await.into_result().expect("seed");

        let decision = rec
            .reconcile_item(&feed("f"), &item("g1", Some("2024-05-01T00:00:00Z")), Utc::now())
            .await;
        assert_eq!(decision, Decision::AlreadySeen);
        assert!(tracker.searches.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn items_without_time_are_left_unrecorded() {
        let tracker = Arc::new(FakeTracker::default());
        let (rec, set) = reconciler(Arc::clone(&tracker), FakeSource::default());

        let decision = rec.reconcile_item(&feed("f"), &item("g1", None), Utc::now()).await;
        assert_eq!(decision, Decision::Unclassifiable);
        assert!(!set.sismember("f", "g1").await.into_result().expect("check"));
        assert!(tracker.searches.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn old_items_are_recorded_without_touching_the_tracker() {
        let tracker = Arc::new(FakeTracker::default());
        tracker.existing.lock().expect("lock").insert("g1".into(), 1);
        let (rec, set) = reconciler(Arc::clone(&tracker), FakeSource::default());

        let decision = rec
            .reconcile_item(&feed("f"), &item("g1", Some("2023-06-01T00:00:00Z")), Utc::now())
            .await;
        assert_eq!(decision, Decision::TooOld);
        assert!(set.sismember("f", "g1").await.into_result().expect("check"));
        assert!(tracker.searches.lock().expect("lock").is_empty());
        assert!(tracker.created.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn remote_matches_are_recorded_without_creating() {
        let tracker = Arc::new(FakeTracker::default());
        tracker.existing.lock().expect("lock").insert("g1".into(), 2);
        let (rec, set) = reconciler(Arc::clone(&tracker), FakeSource::default());

        let decision = rec
            .reconcile_item(&feed("f"), &item("g1", Some("2024-05-01T00:00:00Z")), Utc::now())
            .await;
        assert_eq!(decision, Decision::RemoteDuplicate);
        assert!(set.sismember("f", "g1").await.into_result().expect("check"));
        assert!(tracker.created.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn failed_search_neither_creates_nor_records() {
        let tracker = Arc::new(FakeTracker {
            fail_search: true,
            ..FakeTracker::default()
        });
        let (rec, set) = reconciler(Arc::clone(&tracker), FakeSource::default());

        let decision = rec
            .reconcile_item(&feed("f"), &item("g1", Some("2024-05-01T00:00:00Z")), Utc::now())
            .await;
        assert_eq!(decision, Decision::Failed);
        assert!(!set.sismember("f", "g1").await.into_result().expect("check"));
        assert!(tracker.created.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn creation_records_item_and_counts() {
        let tracker = Arc::new(FakeTracker::default());
        let (rec, set) = reconciler(Arc::clone(&tracker), FakeSource::default());
        let now = ts("2026-01-01T00:00:00Z");

        let decision = rec
            .reconcile_item(&feed("f"), &item("g1", Some("2024-05-01T00:00:00Z")), now)
            .await;
        assert_eq!(decision, Decision::Created);
        assert!(set.sismember("f", "g1").await.into_result().expect("check"));
        assert_eq!(rec.metrics().issues_created(), 1);

        let created = tracker.created.lock().expect("lock");
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, 42);
        assert_eq!(created[0].1.created_at, now);
        assert!(created[0].1.body.ends_with("https://example.com/g1<br>g1"));
    }

    #[tokio::test]
    async fn failed_creation_counts_error_and_stays_candidate() {
        let tracker = Arc::new(FakeTracker {
            fail_create: true,
            ..FakeTracker::default()
        });
        let (rec, set) = reconciler(Arc::clone(&tracker), FakeSource::default());

        let decision = rec
            .reconcile_item(&feed("f"), &item("g1", Some("2024-05-01T00:00:00Z")), Utc::now())
            .await;
        assert_eq!(decision, Decision::Failed);
        assert!(!set.sismember("f", "g1").await.into_result().expect("check"));
        assert_eq!(rec.metrics().creation_errors(), 1);
        assert_eq!(rec.metrics().issues_created(), 0);
    }

    /// Reports every guid as unseen and refuses to record anything.
    struct ReadOnlySet;

    #[async_trait]
    impl SetBackend for ReadOnlySet {
        fn name(&self) -> &'static str {
            "read-only"
        }

        async fn is_member(&self, _key: &str, _member: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn add(&self, _key: &str, _member: &str) -> Result<bool, StoreError> {
            Err(StoreError::Closed)
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn created_issue_that_cannot_be_recorded_is_not_counted() {
        let tracker = Arc::new(FakeTracker::default());
        let rec = Reconciler::new(
            SetClient::new(Arc::new(ReadOnlySet)),
            Arc::new(FakeSource::default()),
            Arc::clone(&tracker) as Arc<dyn IssueTracker>,
            Arc::new(SyncMetrics::new()),
        );

        let decision = rec
            .reconcile_item(&feed("f"), &item("g1", Some("2024-05-01T00:00:00Z")), Utc::now())
            .await;
        assert_eq!(decision, Decision::Failed);
        assert_eq!(rec.metrics().issues_created(), 0);
        assert_eq!(rec.metrics().creation_errors(), 0);
        assert_eq!(tracker.created.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_guids_in_one_batch_create_once() {
        let tracker = Arc::new(FakeTracker::default());
        let f = feed("f");
        let mut source = FakeSource::default();
        source.feeds.insert(
            f.feed_url.clone(),
            vec![
                item("g1", Some("2024-05-01T00:00:00Z")),
                item("g1", Some("2024-05-01T00:00:00Z")),
                item("g2", Some("2023-01-01T00:00:00Z")),
                item("g3", None),
            ],
        );
        let (rec, _set) = reconciler(Arc::clone(&tracker), source);

        let report = rec.check_feed(&f).await.expect("check");
        assert_eq!(report.fetched, 4);
        assert_eq!(report.created, 1);
        assert_eq!(report.already_seen, 1);
        assert_eq!(report.too_old, 1);
        assert_eq!(report.unclassifiable, 1);
        assert_eq!(tracker.created.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn cycle_skips_failing_feeds_and_marks_last_run() {
        let tracker = Arc::new(FakeTracker::default());
        let good = feed("good");
        let mut source = FakeSource::default();
        source
            .feeds
            .insert(good.feed_url.clone(), vec![item("g1", Some("2024-05-01T00:00:00Z"))]);
        let (rec, _set) = reconciler(Arc::clone(&tracker), source);
        let metrics = rec.metrics();
        let poller = Poller::new(
            rec,
            SyncSettings {
                poll_interval: Duration::from_secs(600),
                feeds: vec![feed("broken"), good],
            },
        );

        let summary = poller.run_cycle(&CancellationToken::new()).await;
        assert_eq!(summary.failed_feeds, vec!["broken".to_string()]);
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].created, 1);
        assert!(!summary.interrupted);
        assert!(metrics.last_run() > 0);
    }

    #[tokio::test]
    async fn cancelled_cycle_stops_between_feeds() {
        let tracker = Arc::new(FakeTracker::default());
        let (rec, _set) = reconciler(Arc::clone(&tracker), FakeSource::default());
        let metrics = rec.metrics();
        let poller = Poller::new(
            rec,
            SyncSettings {
                poll_interval: Duration::from_secs(600),
                feeds: vec![feed("a"), feed("b")],
            },
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = poller.run_cycle(&cancel).await;
        assert!(summary.interrupted);
        assert!(summary.reports.is_empty() && summary.failed_feeds.is_empty());
        assert_eq!(metrics.last_run(), 0);

        tokio::time::timeout(Duration::from_secs(5), poller.run(cancel))
            .await
            .expect("loop exits once cancelled");
    }

    #[test]
    fn prometheus_text_lists_all_series() {
        let metrics = SyncMetrics::new();
        metrics.record_created();
        metrics.record_created();
        metrics.record_creation_error();
        metrics.mark_run(ts("2024-05-01T00:00:00Z"));

        let text = metrics.render_prometheus();
        assert!(text.contains("# TYPE issue_creation_total counter\nissue_creation_total 2\n"));
        assert!(text.contains("issue_creation_error_total 1\n"));
        assert!(text.contains("# TYPE last_run_time gauge\nlast_run_time 1714521600\n"));
    }

    #[test]
    fn interval_units() {
        assert_eq!(parse_interval("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_interval("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_interval("6h"), Some(Duration::from_secs(21_600)));
        assert_eq!(parse_interval("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_interval("3600"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_interval("0"), None);
        assert_eq!(parse_interval("soon"), None);
        assert_eq!(parse_interval("5w"), None);
    }

    #[test]
    fn interval_beyond_a_year_is_rejected() {
        assert_eq!(parse_interval("366d"), Some(MAX_INTERVAL));
        assert_eq!(parse_interval("367d"), None);
        assert_eq!(parse_interval("99999999999d"), None);
        assert_eq!(parse_interval("18446744073709551615"), None);
        assert_eq!(parse_interval("99999999999999999999999"), None);
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("GITLAB_API_BASE_URL", "https://gitlab.example.com/api/v4"),
        ("GITLAB_API_TOKEN", "secret"),
        ("CONFIG_DIR", "/etc/feedsync"),
    ];

    #[test]
    fn env_defaults_apply() {
        let cfg = AppConfig::from_lookup(lookup(BASE)).expect("config");
        assert_eq!(cfg.db_path, PathBuf::from("/etc/feedsync/gitlabrsssync.db"));
        assert_eq!(cfg.feeds_file(), PathBuf::from("/etc/feedsync/config.yaml"));
        assert_eq!(cfg.listen_address, DEFAULT_LISTEN_ADDRESS);
        assert!(!cfg.backup.enabled);
        assert_eq!(cfg.backup.region, "us-east-1");
        assert_eq!(cfg.backup.key_prefix, "gitlabrsssync");
        assert_eq!(cfg.backup.interval, DEFAULT_INTERVAL);
        assert_eq!(cfg.http_timeout, Duration::from_secs(20));
        assert!(!cfg.restore_on_start);
    }

    #[test]
    fn env_required_vars_are_fatal() {
        let err = AppConfig::from_lookup(lookup(&BASE[1..])).expect_err("missing base url");
        assert!(matches!(err, ConfigError::MissingVar("GITLAB_API_BASE_URL")));

        let mut vars = BASE.to_vec();
        vars.push(("S3_ENABLED", "true"));
        let err = AppConfig::from_lookup(lookup(&vars)).expect_err("missing bucket");
        assert!(matches!(err, ConfigError::MissingVar("S3_BUCKET_NAME")));
    }

    #[test]
    fn env_backup_settings_and_bad_interval_fallback() {
        let mut vars = BASE.to_vec();
        vars.extend([
            ("S3_ENABLED", "true"),
            ("S3_BUCKET_NAME", "snapshots"),
            ("S3_BACKUP_INTERVAL", "99999999999d"),
            ("RESTORE_ON_START", "1"),
            ("DB_PATH", "/var/lib/feedsync/seen.db"),
        ]);
        let cfg = AppConfig::from_lookup(lookup(&vars)).expect("config");
        assert!(cfg.backup.enabled);
        assert_eq!(cfg.backup.bucket, "snapshots");
        assert_eq!(cfg.backup.interval, DEFAULT_INTERVAL);
        assert!(cfg.restore_on_start);
        assert_eq!(cfg.db_path, PathBuf::from("/var/lib/feedsync/seen.db"));
    }

    #[test]
    fn feeds_yaml_defaults_interval_and_rejects_duplicates() {
        let yaml = r#"
interval: 0
feeds:
  - id: sec-bulletins
    feed_url: https://example.com/feed.xml
    gitlab_project_id: 42
    labels: [security]
    added_since: 2024-01-01T00:00:00Z
"#;
        let settings = SyncSettings::from_yaml_str(yaml).expect("yaml");
        assert_eq!(settings.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(settings.feeds.len(), 1);

        let dup = format!(
            "{yaml}  - id: sec-bulletins\n    feed_url: https://example.com/2.xml\n    \
             gitlab_project_id: 1\n"
        );
        assert!(matches!(
            SyncSettings::from_yaml_str(&dup),
            Err(ConfigError::DuplicateFeed(id)) if id == "sec-bulletins"
        ));

        let custom = SyncSettings::from_yaml_str("interval: 120\nfeeds: []\n").expect("yaml");
        assert_eq!(custom.poll_interval, Duration::from_secs(120));
    }
}
