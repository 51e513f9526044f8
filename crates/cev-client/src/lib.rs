//! Session-authenticated upstream client, pagination walker, and snapshot
//! file I/O for the campus events pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cev_core::{NormalizedEvent, RawEventRecord};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cev-client";

/// Page size requested from the upstream on every call.
pub const DEFAULT_PAGE_SIZE: usize = 40;

/// Consecutive separator-only pages tolerated before the walk gives up.
const MAX_SEPARATOR_STREAK: usize = 3;

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

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// The upstream rejected the session cookie outright.
    #[error("upstream rejected session (status {status}) for {url}")]
    Auth { status: u16, url: String },
    /// The upstream answered with a login page instead of the JSON events
    /// list; an expired SSO cookie redirects there with a 200.
    #[error("session expired: upstream answered non-JSON for {url}")]
    SessionExpired { url: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("malformed events payload for {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::Auth { .. } | FetchError::SessionExpired { .. })
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Auth { .. } | FetchError::SessionExpired { .. } | FetchError::Decode { .. } => {
                RetryDisposition::NonRetryable
            }
            FetchError::HttpStatus { status, .. } => match StatusCode::from_u16(*status) {
                Ok(code) => classify_status(code),
                Err(_) => RetryDisposition::NonRetryable,
            },
            FetchError::Request(err) => classify_reqwest_error(err),
        }
    }
}

/// One page of raw upstream records plus the continuation indicator.
///
/// The endpoint returns a bare JSON array, so `has_more` is derived: a page
/// as large as the requested limit is assumed to continue.
#[derive(Debug, Clone, Default)]
pub struct EventsPage {
    pub records: Vec<RawEventRecord>,
    pub has_more: bool,
}

/// Paginated access to the upstream events list. Implemented by the real
/// session client and by in-memory fakes in walker tests.
#[async_trait]
pub trait EventsApi: Send + Sync {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<EventsPage, FetchError>;
}

#[derive(Debug, Clone)]
pub struct SessionClientConfig {
    pub base_url: String,
    /// Raw browser cookie string, supplied out-of-band. The client never
    /// reads it from ambient process state itself.
    pub cookie: String,
    pub referer: String,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct SessionClient {
    client: reqwest::Client,
    base_url: String,
    cookie: String,
}

impl SessionClient {
    pub fn new(config: SessionClientConfig) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json, text/javascript, */*; q=0.01"),
        );
        headers.insert(
            reqwest::header::REFERER,
            reqwest::header::HeaderValue::from_str(&config.referer)
                .context("building referer header")?,
        );
        headers.insert(
            reqwest::header::HeaderName::from_static("x-requested-with"),
            reqwest::header::HeaderValue::from_static("XMLHttpRequest"),
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            base_url: config.base_url,
            cookie: config.cookie,
        })
    }
}

#[async_trait]
impl EventsApi for SessionClient {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<EventsPage, FetchError> {
        let cache_buster = chrono::Utc::now().timestamp_millis().to_string();
        let resp = self
            .client
            .get(&self.base_url)
            .header(reqwest::header::COOKIE, &self.cookie)
            .query(&[
                ("range", offset.to_string().as_str()),
                ("limit", limit.to_string().as_str()),
                ("filter4_contains", "OR"),
                ("filter4_notcontains", "OR"),
                ("order", "undefined"),
                ("search_word", ""),
                ("_", cache_buster.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        let final_url = resp.url().to_string();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::Auth {
                status: status.as_u16(),
                url: final_url,
            });
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?;
        if body.trim_ascii_start().starts_with(b"<") {
            return Err(FetchError::SessionExpired { url: final_url });
        }
        let records: Vec<RawEventRecord> =
            serde_json::from_slice(&body).map_err(|err| FetchError::Decode {
                url: final_url,
                message: err.to_string(),
            })?;

        let has_more = records.len() >= limit;
        Ok(EventsPage { records, has_more })
    }
}

#[derive(Debug, Error)]
pub enum WalkError {
    /// Stale credentials cannot self-heal, so the walk fails without retry.
    #[error("authentication failed; refresh the session cookie and re-run: {source}")]
    Auth { source: FetchError },
    #[error("page at offset {offset} failed after {attempts} attempts: {source}")]
    PageFailed {
        offset: usize,
        attempts: usize,
        source: FetchError,
    },
}

#[derive(Debug, Clone, Default)]
pub struct WalkOutcome {
    pub records: Vec<RawEventRecord>,
    pub pages_fetched: usize,
    pub separators_skipped: usize,
}

/// Sequentially drains the upstream pagination, retrying individual pages
/// on transient failures and failing the whole walk on auth errors.
#[derive(Debug, Clone)]
pub struct PageWalker {
    pub page_size: usize,
    pub backoff: BackoffPolicy,
}

impl Default for PageWalker {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl PageWalker {
    pub async fn walk(&self, api: &dyn EventsApi) -> Result<WalkOutcome, WalkError> {
        let mut outcome = WalkOutcome::default();
        let mut offset = 0usize;
        let mut separator_streak = 0usize;

        loop {
            let page = self.fetch_with_retry(api, offset).await?;
            outcome.pages_fetched += 1;

            if page.records.is_empty() {
                info!(offset, "upstream returned an empty page, walk complete");
                break;
            }

            let returned = page.records.len();
            let mut kept = 0usize;
            for record in page.records {
                if record.is_separator() {
                    outcome.separators_skipped += 1;
                } else {
                    outcome.records.push(record);
                    kept += 1;
                }
            }

            info!(
                offset,
                returned,
                kept,
                total = outcome.records.len(),
                "page fetched"
            );

            if kept == 0 {
                separator_streak += 1;
                if separator_streak >= MAX_SEPARATOR_STREAK {
                    warn!(offset, "only separator rows in the last {MAX_SEPARATOR_STREAK} pages, stopping");
                    break;
                }
            } else {
                separator_streak = 0;
            }

            if !page.has_more {
                break;
            }
            offset += returned;
        }

        Ok(outcome)
    }

    async fn fetch_with_retry(
        &self,
        api: &dyn EventsApi,
        offset: usize,
    ) -> Result<EventsPage, WalkError> {
        let span = info_span!("fetch_page", offset, limit = self.page_size);
        // Instrumenting keeps the returned future Send, so walks can be
        // spawned onto a runtime.
        async move {
            let mut attempts = 0usize;
            loop {
                attempts += 1;
                match api.fetch_page(offset, self.page_size).await {
                    Ok(page) => return Ok(page),
                    Err(err) if err.is_auth() => return Err(WalkError::Auth { source: err }),
                    Err(err) => {
                        let retriable = err.disposition() == RetryDisposition::Retryable;
                        if retriable && attempts <= self.backoff.max_retries {
                            let delay = self.backoff.delay_for_attempt(attempts - 1);
                            warn!(offset, attempts, "transient page failure, retrying in {delay:?}: {err}");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        return Err(WalkError::PageFailed {
                            offset,
                            attempts,
                            source: err,
                        });
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

/// Write the snapshot atomically: temp file in the target directory, then
/// rename. A crashed run never leaves a truncated snapshot behind.
pub async fn write_snapshot(path: &Path, events: &[NormalizedEvent]) -> anyhow::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
        }
    }

    let bytes = serde_json::to_vec_pretty(events).context("serializing snapshot")?;
    let temp_name = format!(".{}.snapshot.tmp", Uuid::new_v4());
    let temp_path = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(temp_name),
        _ => PathBuf::from(temp_name),
    };

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(path.to_path_buf()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming snapshot {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

pub async fn read_snapshot(path: &Path) -> anyhow::Result<Vec<NormalizedEvent>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing snapshot {}", path.display()))
}

pub async fn snapshot_exists(path: &Path) -> bool {
    fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cev_core::EventKind;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn record(uid: &str) -> RawEventRecord {
        RawEventRecord {
            event_id: Some(format!("e-{uid}")),
            event_uid: Some(uid.to_string()),
            ..RawEventRecord::default()
        }
    }

    fn separator() -> RawEventRecord {
        RawEventRecord {
            listing_separator: Some("true".to_string()),
            ..RawEventRecord::default()
        }
    }

    /// Serves a fixed script of page results and records every call.
    struct ScriptedApi {
        script: Mutex<Vec<Result<EventsPage, FetchError>>>,
        calls: Mutex<Vec<usize>>,
    }

    impl ScriptedApi {
        fn new(script: Vec<Result<EventsPage, FetchError>>) -> Self {
            let mut script = script;
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn offsets_called(&self) -> Vec<usize> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventsApi for ScriptedApi {
        async fn fetch_page(&self, offset: usize, _limit: usize) -> Result<EventsPage, FetchError> {
            self.calls.lock().unwrap().push(offset);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(EventsPage::default()))
        }
    }

    fn page_of(count: usize, start: usize, limit: usize) -> EventsPage {
        let records: Vec<_> = (0..count).map(|i| record(&format!("u{}", start + i))).collect();
        EventsPage {
            has_more: records.len() >= limit,
            records,
        }
    }

    fn walker(page_size: usize) -> PageWalker {
        PageWalker {
            page_size,
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
        }
    }

    #[tokio::test]
    async fn walk_accumulates_every_page_without_trailing_empty_fetch() {
        let api = ScriptedApi::new(vec![
            Ok(page_of(50, 0, 50)),
            Ok(page_of(50, 50, 50)),
            Ok(page_of(50, 100, 50)),
            Ok(page_of(13, 150, 50)),
        ]);

        let outcome = walker(50).walk(&api).await.unwrap();
        assert_eq!(outcome.records.len(), 163);
        assert_eq!(outcome.pages_fetched, 4);
        assert_eq!(api.offsets_called(), vec![0, 50, 100, 150]);
    }

    #[tokio::test]
    async fn walk_future_is_send_and_spawnable() {
        let api = std::sync::Arc::new(ScriptedApi::new(vec![Ok(page_of(2, 0, 40))]));
        let handle = tokio::spawn({
            let api = api.clone();
            async move { walker(40).walk(api.as_ref()).await }
        });

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.records.len(), 2);
    }

    #[tokio::test]
    async fn walk_stops_on_zero_record_page() {
        let api = ScriptedApi::new(vec![Ok(page_of(40, 0, 40)), Ok(EventsPage::default())]);
        let outcome = walker(40).walk(&api).await.unwrap();
        assert_eq!(outcome.records.len(), 40);
        assert_eq!(outcome.pages_fetched, 2);
    }

    #[tokio::test]
    async fn walk_skips_separator_rows_but_advances_past_them() {
        let mut mixed = page_of(3, 0, 5).records;
        mixed.push(separator());
        mixed.push(separator());
        let api = ScriptedApi::new(vec![
            Ok(EventsPage {
                records: mixed,
                has_more: true,
            }),
            Ok(page_of(2, 3, 5)),
        ]);

        let outcome = walker(5).walk(&api).await.unwrap();
        assert_eq!(outcome.records.len(), 5);
        assert_eq!(outcome.separators_skipped, 2);
        assert_eq!(api.offsets_called(), vec![0, 5]);
    }

    #[tokio::test]
    async fn walk_gives_up_after_separator_only_streak() {
        let separator_page = || {
            Ok(EventsPage {
                records: vec![separator(), separator()],
                has_more: true,
            })
        };
        let api = ScriptedApi::new(vec![
            separator_page(),
            separator_page(),
            separator_page(),
            Ok(page_of(10, 0, 2)),
        ]);

        let outcome = walker(2).walk(&api).await.unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.pages_fetched, 3);
    }

    #[tokio::test]
    async fn auth_failure_mid_walk_is_terminal_and_unretried() {
        let api = ScriptedApi::new(vec![
            Ok(page_of(50, 0, 50)),
            Ok(page_of(50, 50, 50)),
            Err(FetchError::Auth {
                status: 401,
                url: "https://example.edu/events".to_string(),
            }),
        ]);

        let err = walker(50).walk(&api).await.unwrap_err();
        assert!(matches!(err, WalkError::Auth { .. }));
        assert_eq!(api.offsets_called().len(), 3);
    }

    #[tokio::test]
    async fn transient_failures_retry_the_same_page() {
        let api = ScriptedApi::new(vec![
            Err(FetchError::HttpStatus {
                status: 503,
                url: "u".into(),
            }),
            Err(FetchError::HttpStatus {
                status: 503,
                url: "u".into(),
            }),
            Ok(page_of(7, 0, 40)),
        ]);

        let outcome = walker(40).walk(&api).await.unwrap();
        assert_eq!(outcome.records.len(), 7);
        assert_eq!(api.offsets_called(), vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_walk() {
        let bad = || {
            Err(FetchError::HttpStatus {
                status: 500,
                url: "u".into(),
            })
        };
        let api = ScriptedApi::new(vec![bad(), bad(), bad(), bad()]);

        let err = walker(40).walk(&api).await.unwrap_err();
        match err {
            WalkError::PageFailed { offset, attempts, .. } => {
                assert_eq!(offset, 0);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn non_json_body_classifies_as_non_retryable() {
        let err = FetchError::SessionExpired { url: "u".into() };
        assert!(err.is_auth());
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    fn normalized(uid: &str) -> NormalizedEvent {
        NormalizedEvent {
            event_id: format!("e-{uid}"),
            event_uid: uid.to_string(),
            name: Some("Test Event".to_string()),
            dates_text: Some("Fri, Oct 3, 2025 5 PM".to_string()),
            starts_at: None,
            ends_at: None,
            category: None,
            location: None,
            online_link: None,
            event_type: EventKind::InPerson,
            organization: None,
            attendees: 0,
            picture_url: None,
            price_range: None,
            button_label: None,
            badges: None,
            event_url: None,
            timezone: None,
            aria_details: None,
        }
    }

    #[tokio::test]
    async fn snapshot_roundtrips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("events_snapshot.json");
        let events = vec![normalized("a"), normalized("b")];

        write_snapshot(&path, &events).await.expect("write");
        assert!(snapshot_exists(&path).await);
        let loaded = read_snapshot(&path).await.expect("read");
        assert_eq!(loaded, events);
    }

    #[tokio::test]
    async fn snapshot_rewrite_replaces_previous_contents() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("events_snapshot.json");

        write_snapshot(&path, &[normalized("a")]).await.expect("first write");
        write_snapshot(&path, &[normalized("b"), normalized("c")])
            .await
            .expect("second write");

        let loaded = read_snapshot(&path).await.expect("read");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].event_uid, "b");
    }
}
