//! Core domain model shared across the campus events pipeline.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "cev-core";

/// Default location of the snapshot file produced by the scraper and
/// consumed by the loader. Both sides must agree on this path when no
/// override is configured.
pub const DEFAULT_SNAPSHOT_PATH: &str = "./data/events_snapshot.json";

/// One event row exactly as the upstream mobile events endpoint emits it.
///
/// The upstream uses positional keys (`p1`, `p2`, ...); this struct gives
/// them names and nothing else. Rows flagged with `listingSeparator` are
/// visual filler between date groups, not events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEventRecord {
    #[serde(rename = "p1", default)]
    pub event_id: Option<String>,
    #[serde(rename = "p2", default)]
    pub event_uid: Option<String>,
    #[serde(rename = "p3", default)]
    pub name: Option<String>,
    /// HTML-bearing date range text.
    #[serde(rename = "p4", default)]
    pub dates_html: Option<String>,
    #[serde(rename = "p5", default)]
    pub category: Option<String>,
    /// HTML-bearing location text, possibly embedding a meeting link.
    #[serde(rename = "p6", default)]
    pub location_html: Option<String>,
    #[serde(rename = "p7", default)]
    pub org_id: Option<String>,
    #[serde(rename = "p8", default)]
    pub org_login: Option<String>,
    #[serde(rename = "p9", default)]
    pub org_name: Option<String>,
    /// Attendee count; the upstream sends either a bare number or a string.
    #[serde(rename = "p10", default)]
    pub attendees: Option<JsonValue>,
    #[serde(rename = "p11", default)]
    pub picture_url: Option<String>,
    #[serde(rename = "p12", default)]
    pub price_range: Option<String>,
    #[serde(rename = "p13", default)]
    pub button_label: Option<String>,
    /// HTML-bearing badge markup.
    #[serde(rename = "p14", default)]
    pub badges_html: Option<String>,
    /// Site-relative event detail path.
    #[serde(rename = "p18", default)]
    pub event_path: Option<String>,
    #[serde(rename = "p28", default)]
    pub timezone: Option<String>,
    #[serde(rename = "p29", default)]
    pub aria_details: Option<String>,
    #[serde(rename = "listingSeparator", default)]
    pub listing_separator: Option<String>,
}

impl RawEventRecord {
    pub fn is_separator(&self) -> bool {
        self.listing_separator.as_deref() == Some("true")
    }
}

/// How attendance happens, derived from location text + online link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InPerson,
    Online,
    Hybrid,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::InPerson => "in_person",
            EventKind::Online => "online",
            EventKind::Hybrid => "hybrid",
        }
    }
}

/// The organization hosting an event, carried nested inside the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationRef {
    pub org_id: String,
    pub org_login: Option<String>,
    pub org_name: Option<String>,
}

/// Canonical event record: the snapshot file is a JSON array of these.
///
/// Schema evolution is additive-only; new fields must carry
/// `#[serde(default)]` so historical snapshots keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub event_id: String,
    /// Globally unique occurrence identifier; dedup key across pages.
    pub event_uid: String,
    pub name: Option<String>,
    /// Visible text of the upstream date field, kept verbatim even when
    /// `starts_at`/`ends_at` parse successfully.
    pub dates_text: Option<String>,
    #[serde(default)]
    pub starts_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub ends_at: Option<NaiveDateTime>,
    pub category: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    pub online_link: Option<String>,
    pub event_type: EventKind,
    pub organization: Option<OrganizationRef>,
    #[serde(default)]
    pub attendees: i32,
    pub picture_url: Option<String>,
    pub price_range: Option<String>,
    pub button_label: Option<String>,
    pub badges: Option<String>,
    pub event_url: Option<String>,
    pub timezone: Option<String>,
    #[serde(default)]
    pub aria_details: Option<String>,
}
