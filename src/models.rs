//! Core data types shared across the sync engines and the timeline builder.
//!
//! Everything here is plain data: engines produce these values, the state
//! store and sync log persist them as JSON, and the timeline reconciler
//! consumes them back.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed per-item transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Added,
    Updated,
    Unchanged,
    Deleted,
    Skipped,
}

impl SyncAction {
    /// Whether this action represents an observable change to the data.
    pub fn is_change(&self) -> bool {
        matches!(
            self,
            SyncAction::Added | SyncAction::Updated | SyncAction::Deleted
        )
    }
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncAction::Added => "added",
            SyncAction::Updated => "updated",
            SyncAction::Unchanged => "unchanged",
            SyncAction::Deleted => "deleted",
            SyncAction::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// One file as seen in a mirror directory listing.
///
/// Ephemeral — rebuilt from the remote listing every run, never persisted.
/// The timestamp is kept raw here; it is parsed (and parse failure becomes a
/// hard error) only for files that pass the inclusion filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub filename: String,
    /// Listing timestamp as shown on the page, e.g. `1/29/2026 8:30 AM`.
    pub timestamp: String,
    pub size: u64,
}

/// Last-known fingerprint for one mirrored file.
///
/// Mirror files carry a `source_modified` timestamp; the API-materialized
/// `ln` extract carries a `content_hash` instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    /// Mirror "Last Modified" timestamp (local time as shown by the source).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_modified: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub bytes: u64,
}

/// Durable per-series sync state.
///
/// This is the only source of truth for "did this file change since the last
/// run" — it is never re-derived by listing the object store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesState {
    pub series: String,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: BTreeMap<String, FileState>,
}

impl SeriesState {
    pub fn empty(series: &str) -> Self {
        Self {
            series: series.to_string(),
            last_sync: None,
            files: BTreeMap::new(),
        }
    }
}

/// Durable per-dataset sync state (content-hash oracle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetState {
    pub dataset: String,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub record_count: Option<u64>,
    #[serde(default)]
    pub year_range: Option<(i64, i64)>,
}

impl DatasetState {
    pub fn empty(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            last_sync: None,
            content_hash: None,
            record_count: None,
            year_range: None,
        }
    }
}

/// One line of the append-only sync log.
///
/// Entries are write-once. Fields not relevant to a given source stay `None`
/// and are omitted from the serialized line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLogEntry {
    /// When the pipeline observed the transition (UTC).
    pub timestamp: DateTime<Utc>,
    /// Resource id: a series id for the mirror, a dataset id for the API.
    pub resource: String,
    /// Item identifier: a filename or a dataset output key.
    pub file: String,
    pub action: SyncAction,
    /// Mirror listing timestamp (source-local naive time), mirror items only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_modified: Option<NaiveDateTime>,
    /// Payload content hash, API items only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    /// Error text from a failed best-effort blob delete. The deletion is
    /// still authoritative (the remote listing no longer has the file).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_error: Option<String>,
}

impl SyncLogEntry {
    pub fn new(resource: &str, file: &str, action: SyncAction, now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now,
            resource: resource.to_string(),
            file: file.to_string(),
            action,
            source_modified: None,
            content_hash: None,
            bytes: None,
            delete_error: None,
        }
    }
}

/// Per-series summary returned by one mirror sync run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
}

impl SeriesSummary {
    pub fn push(&mut self, action: SyncAction, filename: &str) {
        let bucket = match action {
            SyncAction::Added => &mut self.added,
            SyncAction::Updated => &mut self.updated,
            SyncAction::Unchanged => &mut self.unchanged,
            SyncAction::Deleted => &mut self.deleted,
            SyncAction::Skipped => return,
        };
        bucket.push(filename.to_string());
    }
}

/// Outcome of one dataset sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetOutcome {
    pub action: SyncAction,
    /// Object-store key the payload lives at.
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_range: Option<(i64, i64)>,
}

/// One upcoming release parsed from a published schedule page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledRelease {
    pub series: String,
    pub release: String,
    pub url: String,
    pub scheduled_time: DateTime<Utc>,
    /// The schedule-page local rendering, kept for display.
    pub scheduled_time_local: String,
    pub time_zone: String,
}

/// A scheduled release paired with zero or one observed update.
///
/// `actual_time: None` means no update landed inside the tolerance window —
/// reported, not dropped, since the absence of an update is itself signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedRelease {
    pub series: String,
    pub release: String,
    pub url: String,
    pub scheduled_time: DateTime<Utc>,
    pub scheduled_time_local: String,
    pub time_zone: String,
    pub actual_time: Option<DateTime<Utc>>,
    pub delay_minutes: Option<f64>,
    pub actual_files_changed: u64,
    pub actual_bytes_changed: u64,
}

/// A per-resource failure captured by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceError {
    pub resource: String,
    pub error: String,
}

/// Structured result of one full pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub bls: BTreeMap<String, SeriesSummary>,
    pub datausa: BTreeMap<String, DatasetOutcome>,
    pub errors: Vec<ResourceError>,
}

impl SyncReport {
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SyncAction::Added).unwrap(),
            "\"added\""
        );
        assert_eq!(
            serde_json::from_str::<SyncAction>("\"deleted\"").unwrap(),
            SyncAction::Deleted
        );
    }

    #[test]
    fn test_log_entry_omits_empty_fields() {
        let entry = SyncLogEntry::new("pr", "pr.data.0.Current", SyncAction::Unchanged, Utc::now());
        let line = serde_json::to_string(&entry).unwrap();
        assert!(!line.contains("content_hash"));
        assert!(!line.contains("delete_error"));
    }

    #[test]
    fn test_summary_buckets() {
        let mut summary = SeriesSummary::default();
        summary.push(SyncAction::Added, "a");
        summary.push(SyncAction::Deleted, "b");
        summary.push(SyncAction::Skipped, "c");
        assert_eq!(summary.added, vec!["a"]);
        assert_eq!(summary.deleted, vec!["b"]);
        assert!(summary.unchanged.is_empty());
    }
}
