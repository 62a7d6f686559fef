//! External collaborators: the feed reader and the issue tracker client, plus the
//! retrying HTTP client both are built on.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use feedsync_core::{CreatedIssue, FeedItem, IssueMatch, NewIssue};
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "feedsync-adapters";

/// Page size used when searching the tracker for an existing issue.
pub const SEARCH_PAGE_SIZE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Whether a transport error may be retried. Requests with side effects are only
/// retried when the connection was never established.
pub fn classify_reqwest_error(err: &reqwest::Error, idempotent: bool) -> RetryDisposition {
    let retryable = if idempotent {
        err.is_timeout() || err.is_connect() || err.is_request()
    } else {
        err.is_connect()
    };
    if retryable {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(concat!("feedsync/", env!("CARGO_PKG_VERSION")).to_string()),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },
}

/// `reqwest` client with capped exponential backoff on retryable failures.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, HttpError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            backoff: config.backoff,
        })
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send the request produced by `make`, retrying per the backoff policy. A
    /// non-success status ends in [`HttpError::Status`].
    pub async fn send<F>(&self, make: F, idempotent: bool) -> Result<reqwest::Response, HttpError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match make(&self.client).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }

                    let url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%url, status = status.as_u16(), attempt, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(HttpError::Status {
                        status: status.as_u16(),
                        url,
                        body: truncate(&body, 512),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err, idempotent) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(HttpError::Request(err));
                }
            }
        }
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, HttpError> {
        let resp = self.send(|client| client.get(url), true).await?;
        Ok(resp.bytes().await?.to_vec())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("fetching feed: {0}")]
    Fetch(#[from] HttpError),
    #[error("feed is neither RSS ({rss}) nor Atom ({atom})")]
    Parse { rss: String, atom: String },
}

/// Produces the items of a feed, in feed order.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_items(&self, url: &str) -> Result<Vec<FeedItem>, FeedError>;
}

/// RSS 2.0 / Atom feeds fetched over HTTP.
#[derive(Debug, Clone)]
pub struct HttpFeedSource {
    http: HttpClient,
}

impl HttpFeedSource {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch_items(&self, url: &str) -> Result<Vec<FeedItem>, FeedError> {
        let span = info_span!("feed_fetch", url);
        async {
            let body = self.http.get_bytes(url).await?;
            let items = parse_feed(&body)?;
            debug!(items = items.len(), "parsed feed");
            Ok(items)
        }
        .instrument(span)
        .await
    }
}

/// Parse RSS first, then Atom.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<FeedItem>, FeedError> {
    match rss::Channel::read_from(bytes) {
        Ok(channel) => Ok(items_from_rss(&channel)),
        Err(rss_err) => match atom_syndication::Feed::read_from(bytes) {
            Ok(feed) => Ok(items_from_atom(&feed)),
            Err(atom_err) => Err(FeedError::Parse {
                rss: rss_err.to_string(),
                atom: atom_err.to_string(),
            }),
        },
    }
}

fn items_from_rss(channel: &rss::Channel) -> Vec<FeedItem> {
    channel
        .items()
        .iter()
        .filter_map(|item| {
            let guid = item
                .guid()
                .map(|g| g.value().to_string())
                .or_else(|| item.link().map(str::to_string))
                .filter(|g| !g.trim().is_empty());
            let Some(guid) = guid else {
                warn!(
                    title = item.title().unwrap_or_default(),
                    "dropping rss item without guid or link"
                );
                return None;
            };
            Some(FeedItem {
                guid,
                title: item.title().unwrap_or_default().to_string(),
                description: item.description().unwrap_or_default().to_string(),
                content: item.content().unwrap_or_default().to_string(),
                link: item.link().unwrap_or_default().to_string(),
                published_at: item.pub_date().and_then(parse_feed_time),
                updated_at: None,
            })
        })
        .collect()
}

fn items_from_atom(feed: &atom_syndication::Feed) -> Vec<FeedItem> {
    feed.entries()
        .iter()
        .filter_map(|entry| {
            let guid = entry.id().trim();
            if guid.is_empty() {
                warn!(title = %entry.title().value, "dropping atom entry without id");
                return None;
            }
            Some(FeedItem {
                guid: guid.to_string(),
                title: entry.title().value.clone(),
                description: entry
                    .summary()
                    .map(|s| s.value.clone())
                    .unwrap_or_default(),
                content: entry
                    .content()
                    .and_then(|c| c.value())
                    .unwrap_or_default()
                    .to_string(),
                link: entry
                    .links()
                    .first()
                    .map(|l| l.href().to_string())
                    .unwrap_or_default(),
                published_at: entry.published().map(|d| d.with_timezone(&Utc)),
                updated_at: Some(entry.updated().with_timezone(&Utc)),
            })
        })
        .collect()
}

/// RSS dates are RFC 2822, but RFC 3339 shows up often enough to accept it too.
fn parse_feed_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|d| d.with_timezone(&Utc))
        .map_err(|err| debug!(raw, error = %err, "unparseable feed date"))
        .ok()
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("decoding tracker response: {0}")]
    Decode(#[source] reqwest::Error),
}

/// The remote issue tracker: authoritative search plus issue creation.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn search(&self, project_id: u64, token: &str) -> Result<Vec<IssueMatch>, TrackerError>;
    async fn create_issue(
        &self,
        project_id: u64,
        issue: &NewIssue,
    ) -> Result<CreatedIssue, TrackerError>;
}

/// GitLab REST v4 issues client.
#[derive(Debug, Clone)]
pub struct GitLabTracker {
    http: HttpClient,
    base_url: String,
    token: String,
}

#[derive(Debug, Serialize)]
struct CreateIssueRequest<'a> {
    title: &'a str,
    description: &'a str,
    labels: String,
    created_at: String,
}

impl<'a> From<&'a NewIssue> for CreateIssueRequest<'a> {
    fn from(issue: &'a NewIssue) -> Self {
        Self {
            title: &issue.title,
            description: &issue.body,
            labels: issue.labels.join(","),
            created_at: issue.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    id: u64,
    web_url: String,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    web_url: String,
}

impl GitLabTracker {
    pub fn new(http: HttpClient, base_url: &str, token: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn project_url(&self, project_id: u64, tail: &str) -> String {
        format!("{}/projects/{project_id}/{tail}", self.base_url)
    }
}

#[async_trait]
impl IssueTracker for GitLabTracker {
    async fn search(&self, project_id: u64, token: &str) -> Result<Vec<IssueMatch>, TrackerError> {
        let url = self.project_url(project_id, "search");
        let per_page = SEARCH_PAGE_SIZE.to_string();
        let resp = self
            .http
            .send(
                |client| {
                    client
                        .get(&url)
                        .header("PRIVATE-TOKEN", &self.token)
                        .query(&[
                            ("scope", "issues"),
                            ("search", token),
                            ("page", "1"),
                            ("per_page", per_page.as_str()),
                        ])
                },
                true,
            )
            .await?;
        let hits: Vec<SearchHit> = resp.json().await.map_err(TrackerError::Decode)?;
        Ok(hits
            .into_iter()
            .map(|hit| IssueMatch { url: hit.web_url })
            .collect())
    }

    async fn create_issue(
        &self,
        project_id: u64,
        issue: &NewIssue,
    ) -> Result<CreatedIssue, TrackerError> {
        let url = self.project_url(project_id, "issues");
        let body = CreateIssueRequest::from(issue);
        let resp = self
            .http
            .send(
                |client| {
                    client
                        .post(&url)
                        .header("PRIVATE-TOKEN", &self.token)
                        .json(&body)
                },
                false,
            )
            .await?;
        let created: IssueResponse = resp.json().await.map_err(TrackerError::Decode)?;
        Ok(CreatedIssue {
            id: created.id,
            url: created.web_url,
        })
    }
}
