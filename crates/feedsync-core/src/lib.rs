//! Core domain model for feedsync: feeds, items, seen rows, tracker issues and snapshot naming.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "feedsync-core";

/// Timestamp layout embedded in snapshot object names. Colons are avoided so the
/// name is safe as an object key and as a local file name.
pub const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";

/// Separator placed between the issue body and its traceability footer.
pub const FOOTER_SEPARATOR: &str = "<br>";

/// A configured feed. Loaded once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRecord {
    /// Partition key in the dedup store; must stay stable across restarts.
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub feed_url: String,
    #[serde(rename = "gitlab_project_id", alias = "tracker_project_id")]
    pub tracker_project_id: u64,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Items older than this are recorded as seen without being synced.
    #[serde(default)]
    pub added_since: DateTime<Utc>,
    /// Backdate created issues to the item's own timestamp.
    #[serde(default)]
    pub retroactive: bool,
}

impl FeedRecord {
    /// Human-facing label for logs; falls back to the id when no name is configured.
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn predates_cutoff(&self, item_time: DateTime<Utc>) -> bool {
        item_time < self.added_since
    }

    pub fn issue_timestamp(&self, item_time: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.retroactive {
            item_time
        } else {
            now
        }
    }

    /// Build the creation request for `item`, whose effective timestamp is `item_time`.
    pub fn new_issue(
        &self,
        item: &FeedItem,
        item_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> NewIssue {
        NewIssue {
            title: item.title.clone(),
            body: item.issue_body(),
            labels: self.labels.clone(),
            created_at: self.issue_timestamp(item_time, now),
        }
    }
}

/// One entry produced by a feed source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FeedItem {
    pub guid: String,
    pub title: String,
    pub description: String,
    pub content: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl FeedItem {
    /// Updated time wins over published time; `None` means the item cannot be classified.
    pub fn effective_timestamp(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.published_at)
    }

    /// Rich content when present, else the plain description, followed by the link and
    /// GUID so the GUID can always be found again by a remote search.
    pub fn issue_body(&self) -> String {
        let body = if self.content.trim().is_empty() {
            self.description.as_str()
        } else {
            self.content.as_str()
        };
        format!(
            "{body}{sep}{link}{sep}{guid}",
            sep = FOOTER_SEPARATOR,
            link = self.link,
            guid = self.guid
        )
    }
}

/// A persisted `(feed_id, guid)` membership row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenItem {
    pub feed_id: String,
    pub guid: String,
    pub recorded_at: DateTime<Utc>,
}

/// Creation request handed to the issue tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedIssue {
    pub id: u64,
    pub url: String,
}

/// A remote issue matched by a search token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueMatch {
    pub url: String,
}

/// Outcome of reconciling one feed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    /// Already recorded locally.
    AlreadySeen,
    /// No updated or published time; left for a later poll.
    Unclassifiable,
    /// Older than the feed cutoff; recorded without creating anything.
    TooOld,
    /// The tracker already has an issue carrying this GUID; recorded.
    RemoteDuplicate,
    /// A new issue was created.
    Created,
    /// Local or remote I/O failed; nothing recorded, retried next poll.
    Failed,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::AlreadySeen => "already_seen",
            Decision::Unclassifiable => "unclassifiable",
            Decision::TooOld => "too_old",
            Decision::RemoteDuplicate => "remote_duplicate",
            Decision::Created => "created",
            Decision::Failed => "failed",
        }
    }
}

/// Name of one backup object: `<prefix>/<UTC timestamp>.db`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SnapshotKey {
    prefix: String,
    taken_at: DateTime<Utc>,
}

impl SnapshotKey {
    pub fn new(prefix: &str, taken_at: DateTime<Utc>) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
            taken_at,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn object_key(&self) -> String {
        let stamp = self.taken_at.format(SNAPSHOT_TIMESTAMP_FORMAT);
        if self.prefix.is_empty() {
            format!("{stamp}.db")
        } else {
            format!("{}/{stamp}.db", self.prefix)
        }
    }

    /// Parse an object key produced by [`SnapshotKey::object_key`]. Foreign objects under
    /// the prefix yield `None`.
    pub fn parse(key: &str) -> Option<Self> {
        let (prefix, file) = key.rsplit_once('/').unwrap_or(("", key));
        let stem = file.strip_suffix(".db")?;
        let taken_at = NaiveDateTime::parse_from_str(stem, SNAPSHOT_TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();
        Some(Self::new(prefix, taken_at))
    }
}
