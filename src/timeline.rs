//! Trailing-window change timeline and release reconciliation.
//!
//! The sync engines journal every observed transition into per-resource sync
//! logs. This module reads those logs back, normalizes the timestamps to UTC,
//! and builds a compact JSON payload for a UI: recent change events, the
//! scraped release schedule, and each scheduled release paired with the
//! change burst that most plausibly was it.
//!
//! Mirror listing timestamps are naive local times in the source's timezone
//! (Eastern for bls.gov); they become the event time when present, with the
//! pipeline's own observation time as fallback.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::models::{MatchedRelease, ScheduledRelease, SyncAction, SyncLogEntry};
use crate::state::StateStore;
use crate::store::ObjectStore;

/// One change event with its timestamps normalized to UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub series: String,
    pub file: String,
    pub action: SyncAction,
    /// Best-known instant of the change: `source_modified` when the source
    /// published one, otherwise `observed_at`.
    pub event_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_modified: Option<DateTime<Utc>>,
    pub observed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

/// The exported timeline document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelinePayload {
    pub generated_at: DateTime<Utc>,
    pub window_days: i64,
    pub lookahead_days: i64,
    pub events: Vec<ChangeEvent>,
    pub scheduled_releases: Vec<ScheduledRelease>,
    pub releases: Vec<MatchedRelease>,
}

/// Turn one sync log entry into a normalized change event.
///
/// Non-change actions (`unchanged`, `skipped`) yield `None`.
pub fn normalize_entry(series: &str, entry: &SyncLogEntry, source_tz: Tz) -> Option<ChangeEvent> {
    if !entry.action.is_change() {
        return None;
    }

    let source_modified = entry
        .source_modified
        .and_then(|naive| source_tz.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc));

    Some(ChangeEvent {
        series: series.to_string(),
        file: entry.file.clone(),
        action: entry.action,
        event_time: source_modified.unwrap_or(entry.timestamp),
        source_modified,
        observed_at: entry.timestamp,
        bytes: entry.bytes,
    })
}

/// Read every series' sync log and return change events.
///
/// A series whose log cannot be read contributes nothing; the timeline
/// degrades rather than fails.
pub async fn collect_change_events(
    store: &dyn ObjectStore,
    series_list: &[String],
    source_tz: Tz,
) -> Vec<ChangeEvent> {
    let states = StateStore::new(store);
    let mut events = Vec::new();
    for series in series_list {
        match states.read_log(series).await {
            Ok(entries) => {
                events.extend(
                    entries
                        .iter()
                        .filter_map(|e| normalize_entry(series, e, source_tz)),
                );
            }
            Err(e) => {
                tracing::warn!(series = %series, error = %e, "sync log read failed, omitting from timeline");
            }
        }
    }
    events
}

/// Keep events inside `[now - window_days, now + lookahead_days]` and order
/// them newest first, with series/file/action as the tiebreak.
pub fn window_events(
    mut events: Vec<ChangeEvent>,
    now: DateTime<Utc>,
    window_days: i64,
    lookahead_days: i64,
) -> Vec<ChangeEvent> {
    let start = now - Duration::days(window_days.max(1));
    let end = now + Duration::days(lookahead_days.max(0));

    events.retain(|e| e.event_time >= start && e.event_time <= end);
    events.sort_by(|a, b| {
        b.event_time
            .cmp(&a.event_time)
            .then_with(|| a.series.cmp(&b.series))
            .then_with(|| a.file.cmp(&b.file))
    });
    events
}

/// Aggregate of one burst of changes at a single instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeBurst {
    pub files_changed: u64,
    pub bytes_changed: u64,
}

/// Group `added`/`updated` events by series and event time. Deletions are
/// excluded: removing a file is not a release landing.
pub fn group_actual_by_series_time(
    events: &[ChangeEvent],
) -> BTreeMap<String, BTreeMap<DateTime<Utc>, ChangeBurst>> {
    let mut out: BTreeMap<String, BTreeMap<DateTime<Utc>, ChangeBurst>> = BTreeMap::new();
    for event in events {
        if !matches!(event.action, SyncAction::Added | SyncAction::Updated) {
            continue;
        }
        let burst = out
            .entry(event.series.clone())
            .or_default()
            .entry(event.event_time)
            .or_default();
        burst.files_changed += 1;
        burst.bytes_changed += event.bytes.unwrap_or(0);
    }
    out
}

/// Pair one scheduled release with the closest observed change burst.
///
/// Candidates must land inside `[-early_minutes, +late_hours]` of the
/// scheduled time; among them, smallest absolute distance wins, and at equal
/// distance the earliest actual time wins. No candidate means an unmatched
/// release, not a dropped one.
pub fn match_release(
    scheduled: &ScheduledRelease,
    actual_by_series_time: &BTreeMap<String, BTreeMap<DateTime<Utc>, ChangeBurst>>,
    early_minutes: i64,
    late_hours: i64,
) -> MatchedRelease {
    let unmatched = MatchedRelease {
        series: scheduled.series.clone(),
        release: scheduled.release.clone(),
        url: scheduled.url.clone(),
        scheduled_time: scheduled.scheduled_time,
        scheduled_time_local: scheduled.scheduled_time_local.clone(),
        time_zone: scheduled.time_zone.clone(),
        actual_time: None,
        delay_minutes: None,
        actual_files_changed: 0,
        actual_bytes_changed: 0,
    };

    let Some(series_times) = actual_by_series_time.get(&scheduled.series) else {
        return unmatched;
    };

    let early_margin = Duration::minutes(early_minutes.max(0));
    let late_margin = Duration::hours(late_hours.max(1));

    let mut candidates: Vec<(i64, DateTime<Utc>, ChangeBurst)> = Vec::new();
    for (&actual_time, &burst) in series_times {
        let delta = actual_time - scheduled.scheduled_time;
        if delta < -early_margin || delta > late_margin {
            continue;
        }
        candidates.push((delta.num_seconds().abs(), actual_time, burst));
    }

    let Some(&(_, actual_time, burst)) = candidates
        .iter()
        .min_by_key(|(abs, actual_time, _)| (*abs, *actual_time))
    else {
        return unmatched;
    };

    let delay_seconds = (actual_time - scheduled.scheduled_time).num_seconds() as f64;
    let delay_minutes = (delay_seconds / 60.0 * 10.0).round() / 10.0;

    MatchedRelease {
        actual_time: Some(actual_time),
        delay_minutes: Some(delay_minutes),
        actual_files_changed: burst.files_changed,
        actual_bytes_changed: burst.bytes_changed,
        ..unmatched
    }
}

/// Pair every scheduled release with its observed change burst, ordered by
/// scheduled time.
pub fn build_release_timeline(
    scheduled: &[ScheduledRelease],
    events: &[ChangeEvent],
    early_minutes: i64,
    late_hours: i64,
) -> Vec<MatchedRelease> {
    let actual = group_actual_by_series_time(events);
    let mut releases: Vec<MatchedRelease> = scheduled
        .iter()
        .map(|s| match_release(s, &actual, early_minutes, late_hours))
        .collect();
    releases.sort_by_key(|r| r.scheduled_time);
    releases
}

/// Assemble the full timeline document.
pub fn build_timeline_payload(
    events: Vec<ChangeEvent>,
    scheduled: Vec<ScheduledRelease>,
    now: DateTime<Utc>,
    window_days: i64,
    lookahead_days: i64,
    early_minutes: i64,
    late_hours: i64,
) -> TimelinePayload {
    let events = window_events(events, now, window_days, lookahead_days);
    let releases = build_release_timeline(&scheduled, &events, early_minutes, late_hours);
    TimelinePayload {
        generated_at: now,
        window_days: window_days.max(1),
        lookahead_days: lookahead_days.max(0),
        events,
        scheduled_releases: scheduled,
        releases,
    }
}

/// Write the timeline document as pretty JSON, creating parent directories.
pub fn write_timeline(payload: &TimelinePayload, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create timeline output dir {}", parent.display()))?;
    }
    let mut body = serde_json::to_vec_pretty(payload).context("serialize timeline payload")?;
    body.push(b'\n');
    std::fs::write(path, body).with_context(|| format!("write timeline {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    fn entry(
        file: &str,
        action: SyncAction,
        source_modified: Option<&str>,
        observed: &str,
        bytes: Option<u64>,
    ) -> SyncLogEntry {
        let observed = observed.parse::<DateTime<Utc>>().unwrap();
        let mut e = SyncLogEntry::new("pr", file, action, observed);
        e.source_modified = source_modified.map(|s| s.parse().unwrap());
        e.bytes = bytes;
        e
    }

    fn event(
        series: &str,
        file: &str,
        action: SyncAction,
        event_time: &str,
        bytes: Option<u64>,
    ) -> ChangeEvent {
        let event_time = event_time.parse::<DateTime<Utc>>().unwrap();
        ChangeEvent {
            series: series.to_string(),
            file: file.to_string(),
            action,
            event_time,
            source_modified: Some(event_time),
            observed_at: event_time,
            bytes,
        }
    }

    fn scheduled(series: &str, time: &str) -> ScheduledRelease {
        ScheduledRelease {
            series: series.to_string(),
            release: "Productivity and Costs".to_string(),
            url: "https://www.bls.gov/schedule/news_release/prod2.htm".to_string(),
            scheduled_time: time.parse().unwrap(),
            scheduled_time_local: String::new(),
            time_zone: "America/New_York".to_string(),
        }
    }

    #[test]
    fn test_normalize_uses_source_time_in_source_tz() {
        // 8:30 local Eastern in February is 13:30 UTC.
        let e = entry(
            "pr.data.0.Current",
            SyncAction::Updated,
            Some("2026-02-01T08:30:00"),
            "2026-02-01T14:02:11Z",
            Some(1024),
        );
        let normalized = normalize_entry("pr", &e, New_York).unwrap();
        assert_eq!(
            normalized.event_time,
            Utc.with_ymd_and_hms(2026, 2, 1, 13, 30, 0).unwrap()
        );
        assert_eq!(normalized.source_modified, Some(normalized.event_time));
        assert_eq!(normalized.bytes, Some(1024));
    }

    #[test]
    fn test_normalize_falls_back_to_observed_time() {
        let e = entry(
            "ln.data.0.Current",
            SyncAction::Updated,
            None,
            "2026-02-01T14:02:11Z",
            None,
        );
        let normalized = normalize_entry("ln", &e, New_York).unwrap();
        assert_eq!(
            normalized.event_time,
            "2026-02-01T14:02:11Z".parse::<DateTime<Utc>>().unwrap()
        );
        assert!(normalized.source_modified.is_none());
    }

    #[test]
    fn test_normalize_drops_non_changes() {
        let e = entry("a", SyncAction::Unchanged, None, "2026-02-01T14:00:00Z", None);
        assert!(normalize_entry("pr", &e, New_York).is_none());
        let e = entry("a", SyncAction::Skipped, None, "2026-02-01T14:00:00Z", None);
        assert!(normalize_entry("pr", &e, New_York).is_none());
    }

    #[test]
    fn test_window_filter_and_ordering() {
        let now = "2026-02-10T00:00:00Z".parse().unwrap();
        let events = vec![
            event("pr", "b", SyncAction::Added, "2026-02-01T13:30:00Z", None),
            event("cu", "a", SyncAction::Added, "2026-02-05T13:30:00Z", None),
            event("pr", "a", SyncAction::Added, "2026-02-01T13:30:00Z", None),
            // Too old for a 5-day window.
            event("pr", "c", SyncAction::Added, "2026-02-01T13:29:59Z", None),
            // In the future, no lookahead.
            event("pr", "d", SyncAction::Added, "2026-02-11T00:00:00Z", None),
        ];

        let windowed = window_events(events, now, 5, 0);
        let order: Vec<&str> = windowed.iter().map(|e| e.file.as_str()).collect();
        // Newest first; ties break on series then file.
        assert_eq!(order, vec!["a", "a", "b"]);
        assert_eq!(windowed[0].series, "cu");
    }

    #[test]
    fn test_grouping_aggregates_bursts() {
        let events = vec![
            event("pr", "a", SyncAction::Added, "2026-02-01T13:30:00Z", Some(10)),
            event("pr", "b", SyncAction::Updated, "2026-02-01T13:30:00Z", Some(5)),
            event("pr", "c", SyncAction::Deleted, "2026-02-01T13:30:00Z", Some(99)),
            event("pr", "d", SyncAction::Added, "2026-02-02T13:30:00Z", None),
        ];
        let grouped = group_actual_by_series_time(&events);
        let pr = &grouped["pr"];
        assert_eq!(pr.len(), 2);

        let burst = pr[&"2026-02-01T13:30:00Z".parse::<DateTime<Utc>>().unwrap()];
        assert_eq!(burst.files_changed, 2);
        assert_eq!(burst.bytes_changed, 15);
    }

    #[test]
    fn test_on_time_release_has_zero_delay() {
        let events = vec![event(
            "pr",
            "pr.data.0.Current",
            SyncAction::Updated,
            "2026-02-01T13:30:00Z",
            Some(2048),
        )];
        let releases = build_release_timeline(
            &[scheduled("pr", "2026-02-01T13:30:00Z")],
            &events,
            15,
            24,
        );

        assert_eq!(releases.len(), 1);
        let release = &releases[0];
        assert_eq!(release.actual_time, Some("2026-02-01T13:30:00Z".parse().unwrap()));
        assert_eq!(release.delay_minutes, Some(0.0));
        assert_eq!(release.actual_files_changed, 1);
        assert_eq!(release.actual_bytes_changed, 2048);
    }

    #[test]
    fn test_unmatched_release_is_reported_not_dropped() {
        let releases = build_release_timeline(
            &[scheduled("pr", "2026-02-01T13:30:00Z")],
            &[],
            15,
            24,
        );
        assert_eq!(releases.len(), 1);
        let release = &releases[0];
        assert!(release.actual_time.is_none());
        assert!(release.delay_minutes.is_none());
        assert_eq!(release.actual_files_changed, 0);
        assert_eq!(release.actual_bytes_changed, 0);
    }

    #[test]
    fn test_match_window_excludes_too_early_and_too_late() {
        let events = vec![
            // 16 minutes early: outside the 15-minute early margin.
            event("pr", "a", SyncAction::Updated, "2026-02-01T13:14:00Z", None),
            // 25 hours late: outside the 24-hour late margin.
            event("pr", "b", SyncAction::Updated, "2026-02-02T14:30:00Z", None),
        ];
        let releases = build_release_timeline(
            &[scheduled("pr", "2026-02-01T13:30:00Z")],
            &events,
            15,
            24,
        );
        assert!(releases[0].actual_time.is_none());
    }

    #[test]
    fn test_tie_breaks_on_earliest_actual_time() {
        // Ten minutes early and ten minutes late, equidistant.
        let events = vec![
            event("pr", "a", SyncAction::Updated, "2026-02-01T13:20:00Z", None),
            event("pr", "b", SyncAction::Updated, "2026-02-01T13:40:00Z", None),
        ];
        let releases = build_release_timeline(
            &[scheduled("pr", "2026-02-01T13:30:00Z")],
            &events,
            15,
            24,
        );
        assert_eq!(
            releases[0].actual_time,
            Some("2026-02-01T13:20:00Z".parse().unwrap())
        );
        assert_eq!(releases[0].delay_minutes, Some(-10.0));

        // A strictly closer candidate still wins regardless of side.
        let events = vec![
            event("pr", "a", SyncAction::Updated, "2026-02-01T13:20:00Z", None),
            event("pr", "b", SyncAction::Updated, "2026-02-01T13:35:00Z", None),
        ];
        let releases = build_release_timeline(
            &[scheduled("pr", "2026-02-01T13:30:00Z")],
            &events,
            15,
            24,
        );
        assert_eq!(releases[0].delay_minutes, Some(5.0));
    }

    #[test]
    fn test_delay_rounds_to_tenth_of_minute() {
        let events = vec![event(
            "pr",
            "a",
            SyncAction::Updated,
            "2026-02-01T13:31:30Z",
            None,
        )];
        let releases = build_release_timeline(
            &[scheduled("pr", "2026-02-01T13:30:00Z")],
            &events,
            15,
            24,
        );
        assert_eq!(releases[0].delay_minutes, Some(1.5));
    }

    #[tokio::test]
    async fn test_collect_reads_logs_and_skips_missing() {
        use crate::store::memory::MemoryStore;

        let store = MemoryStore::new();
        let states = StateStore::new(&store);
        states
            .append_log(
                "pr",
                &entry(
                    "pr.data.0.Current",
                    SyncAction::Added,
                    Some("2026-02-01T08:30:00"),
                    "2026-02-01T14:00:00Z",
                    Some(100),
                ),
            )
            .await
            .unwrap();
        states
            .append_log(
                "pr",
                &entry(
                    "pr.data.0.Current",
                    SyncAction::Unchanged,
                    None,
                    "2026-02-02T14:00:00Z",
                    None,
                ),
            )
            .await
            .unwrap();

        let series = vec!["pr".to_string(), "cu".to_string()];
        let events = collect_change_events(&store, &series, New_York).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].series, "pr");
        assert_eq!(events[0].action, SyncAction::Added);
    }
}
