//! Record normalization and the end-to-end scrape run.
//!
//! The upstream embeds HTML in several data fields (dates, location,
//! badges). Everything that touches that markup goes through the two
//! utilities [`visible_text`] and [`embedded_meeting_link`], so an upstream
//! markup change requires exactly one seam to move.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use cev_client::{
    write_snapshot, EventsApi, PageWalker, SessionClient, SessionClientConfig, WalkError,
};
use cev_core::{
    EventKind, NormalizedEvent, OrganizationRef, RawEventRecord, DEFAULT_SNAPSHOT_PATH,
};
use chrono::{NaiveDateTime, NaiveTime};
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cev-scraper";

/// Anchor hrefs pointing at these domains count as meeting links.
const MEETING_DOMAINS: &[&str] = &[
    "zoom.us",
    "teams.microsoft.com",
    "meet.google.com",
    "webex.com",
];

#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub events_url: String,
    pub portal_base_url: String,
    pub cookie: String,
    pub snapshot_path: PathBuf,
    pub page_size: usize,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
}

impl ScraperConfig {
    /// Reads configuration from the environment. The session cookie has no
    /// default: it is copied out of a logged-in browser session and expires.
    pub fn from_env() -> anyhow::Result<Self> {
        let cookie = std::env::var("SCRAPER_COOKIE")
            .context("SCRAPER_COOKIE is not set; copy the session cookie from a logged-in browser")?;
        let portal_base_url = std::env::var("EVENTS_PORTAL_URL")
            .unwrap_or_else(|_| "https://sundevilcentral.eoss.asu.edu".to_string());
        let events_url = std::env::var("EVENTS_API_URL")
            .unwrap_or_else(|_| format!("{portal_base_url}/mobile_ws/v17/mobile_events_list"));
        Ok(Self {
            events_url,
            portal_base_url,
            cookie,
            snapshot_path: std::env::var("SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_SNAPSHOT_PATH)),
            page_size: std::env::var("CEV_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(cev_client::DEFAULT_PAGE_SIZE),
            http_timeout_secs: std::env::var("CEV_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            max_retries: std::env::var("CEV_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
        })
    }
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Walk(#[from] WalkError),
    #[error("writing snapshot failed: {0}")]
    Snapshot(anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct ScrapeSummary {
    pub run_id: Uuid,
    pub pages_fetched: usize,
    pub records_fetched: usize,
    pub separators_skipped: usize,
    pub skipped_missing_ids: usize,
    pub duplicates_collapsed: usize,
    pub events_written: usize,
    pub output_path: PathBuf,
}

/// Collapse visible text out of an HTML fragment: markup stripped, entity
/// references decoded, runs of whitespace folded to single spaces.
pub fn visible_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let text = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Find an anchor inside the fragment whose href points at a known
/// video-conferencing domain.
pub fn embedded_meeting_link(html: &str) -> Option<String> {
    let fragment = Html::parse_fragment(html);
    let selector = Selector::parse("a[href]").expect("static selector");
    fragment
        .select(&selector)
        .filter_map(|node| node.value().attr("href"))
        .find(|href| MEETING_DOMAINS.iter().any(|domain| href.contains(domain)))
        .map(ToString::to_string)
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Drop a trailing timezone abbreviation ("MST", "PDT") so the remainder
/// can be parsed as a plain wall-clock datetime.
fn strip_zone_suffix(text: &str) -> &str {
    let trimmed = text.trim_end();
    if let Some(idx) = trimmed.rfind(' ') {
        let tail = &trimmed[idx + 1..];
        if tail.len() >= 2
            && tail.len() <= 4
            && tail.chars().all(|c| c.is_ascii_uppercase())
            && tail != "AM"
            && tail != "PM"
        {
            return trimmed[..idx].trim_end();
        }
    }
    trimmed
}

const DATETIME_FORMATS: &[&str] = &[
    "%a, %b %d, %Y %I:%M %p",
    "%a, %b %d, %Y %I %p",
    "%A, %B %d, %Y %I:%M %p",
    "%A, %B %d, %Y %I %p",
];

const TIME_FORMATS: &[&str] = &["%I:%M %p", "%I %p"];

fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let text = strip_zone_suffix(text);
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
}

fn parse_time(text: &str) -> Option<NaiveTime> {
    let text = strip_zone_suffix(text);
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(text, fmt).ok())
}

/// Parse the upstream free-text date range. Returns `(None, None)` when the
/// text is not machine-parseable; callers keep the source text either way.
pub fn parse_date_range(text: &str) -> (Option<NaiveDateTime>, Option<NaiveDateTime>) {
    let mut parts = text.splitn(2, ['\u{2013}', '\u{2014}']);
    let mut head = parts.next().unwrap_or_default();
    let mut tail = parts.next();
    if tail.is_none() {
        let mut words = head.splitn(2, " to ");
        head = words.next().unwrap_or_default();
        tail = words.next();
    }

    let Some(start) = parse_datetime(head.trim()) else {
        return (None, None);
    };

    let end = tail.map(str::trim).and_then(|tail| {
        parse_datetime(tail).or_else(|| parse_time(tail).map(|t| start.date().and_time(t)))
    });

    (Some(start), end)
}

/// The upstream sends attendee counts as numbers, numeric strings, or not
/// at all; anything non-numeric counts as zero.
pub fn coerce_attendees(value: Option<&JsonValue>) -> i32 {
    match value {
        Some(JsonValue::Number(n)) => n.as_i64().unwrap_or(0).clamp(0, i32::MAX as i64) as i32,
        Some(JsonValue::String(s)) => s.trim().parse::<i32>().unwrap_or(0).max(0),
        _ => 0,
    }
}

fn classify(location: Option<&str>, online_link: Option<&str>) -> EventKind {
    match (location.map(|l| !l.is_empty()).unwrap_or(false), online_link.is_some()) {
        (true, true) => EventKind::Hybrid,
        (false, true) => EventKind::Online,
        _ => EventKind::InPerson,
    }
}

/// Map one raw upstream record into the canonical schema. Returns `None`
/// when the record carries neither identifier; the caller counts the skip.
pub fn normalize_record(raw: &RawEventRecord, portal_base_url: &str) -> Option<NormalizedEvent> {
    let (event_id, event_uid) = match (&raw.event_id, &raw.event_uid) {
        (Some(id), Some(uid)) => (id.clone(), uid.clone()),
        (Some(id), None) => (id.clone(), id.clone()),
        (None, Some(uid)) => (uid.clone(), uid.clone()),
        (None, None) => return None,
    };

    let dates_text = raw
        .dates_html
        .as_deref()
        .and_then(|html| text_or_none(visible_text(html)));
    let (starts_at, ends_at) = dates_text
        .as_deref()
        .map(parse_date_range)
        .unwrap_or((None, None));

    let online_link = raw.location_html.as_deref().and_then(embedded_meeting_link);
    let location = raw.location_html.as_deref().and_then(|html| {
        let text = visible_text(html);
        // The anchor's label text is not a physical location.
        let text = match &online_link {
            Some(link) if text.contains(link.as_str()) => text.replace(link.as_str(), ""),
            _ => text,
        };
        text_or_none(text)
    });
    let event_type = classify(location.as_deref(), online_link.as_deref());

    let organization = raw.org_id.as_ref().map(|org_id| OrganizationRef {
        org_id: org_id.clone(),
        org_login: raw.org_login.clone(),
        org_name: raw.org_name.clone(),
    });

    let event_url = raw
        .event_path
        .as_deref()
        .map(|path| format!("{}{}", portal_base_url.trim_end_matches('/'), path));

    Some(NormalizedEvent {
        event_id,
        event_uid,
        name: raw.name.clone(),
        dates_text,
        starts_at,
        ends_at,
        category: raw.category.clone(),
        location,
        online_link,
        event_type,
        organization,
        attendees: coerce_attendees(raw.attendees.as_ref()),
        picture_url: raw.picture_url.clone(),
        price_range: raw.price_range.clone(),
        button_label: raw.button_label.clone(),
        badges: raw
            .badges_html
            .as_deref()
            .and_then(|html| text_or_none(visible_text(html))),
        event_url,
        timezone: raw.timezone.clone(),
        aria_details: raw.aria_details.clone(),
    })
}

/// Collapse repeated `event_uid`s, keeping the last occurrence's data in
/// the first occurrence's position. Later pages carry more complete rows.
pub fn dedupe_by_uid(events: Vec<NormalizedEvent>) -> (Vec<NormalizedEvent>, usize) {
    let mut index_by_uid: HashMap<String, usize> = HashMap::with_capacity(events.len());
    let mut out: Vec<NormalizedEvent> = Vec::with_capacity(events.len());
    let mut collapsed = 0usize;

    for event in events {
        match index_by_uid.get(&event.event_uid) {
            Some(&idx) => {
                out[idx] = event;
                collapsed += 1;
            }
            None => {
                index_by_uid.insert(event.event_uid.clone(), out.len());
                out.push(event);
            }
        }
    }
    (out, collapsed)
}

/// Walk the upstream, normalize, dedupe, and write the snapshot. The
/// snapshot is written only after the walk fully succeeds; a failed run
/// leaves no file behind.
pub async fn run_scrape_with(
    api: &dyn EventsApi,
    walker: &PageWalker,
    portal_base_url: &str,
    output_path: &std::path::Path,
) -> Result<ScrapeSummary, ScrapeError> {
    let run_id = Uuid::new_v4();
    info!(%run_id, "starting scrape run");

    let outcome = walker.walk(api).await?;

    let mut skipped_missing_ids = 0usize;
    let mut normalized = Vec::with_capacity(outcome.records.len());
    for raw in &outcome.records {
        match normalize_record(raw, portal_base_url) {
            Some(event) => normalized.push(event),
            None => {
                skipped_missing_ids += 1;
                warn!(%run_id, "skipping record with no event identifiers");
            }
        }
    }

    let (events, duplicates_collapsed) = dedupe_by_uid(normalized);
    write_snapshot(output_path, &events)
        .await
        .map_err(ScrapeError::Snapshot)?;

    let summary = ScrapeSummary {
        run_id,
        pages_fetched: outcome.pages_fetched,
        records_fetched: outcome.records.len(),
        separators_skipped: outcome.separators_skipped,
        skipped_missing_ids,
        duplicates_collapsed,
        events_written: events.len(),
        output_path: output_path.to_path_buf(),
    };
    info!(
        %run_id,
        pages = summary.pages_fetched,
        written = summary.events_written,
        "scrape run complete"
    );
    Ok(summary)
}

/// Entry point used by the CLI: builds the real session client from config.
pub async fn run_scrape(config: &ScraperConfig) -> anyhow::Result<ScrapeSummary> {
    let client = SessionClient::new(SessionClientConfig {
        base_url: config.events_url.clone(),
        cookie: config.cookie.clone(),
        referer: format!("{}/events", config.portal_base_url.trim_end_matches('/')),
        timeout: Duration::from_secs(config.http_timeout_secs),
    })?;
    let walker = PageWalker {
        page_size: config.page_size,
        backoff: cev_client::BackoffPolicy {
            max_retries: config.max_retries,
            ..cev_client::BackoffPolicy::default()
        },
    };
    run_scrape_with(&client, &walker, &config.portal_base_url, &config.snapshot_path)
        .await
        .context("scrape run failed")
}
