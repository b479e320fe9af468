//! Top-level orchestration: one sync run, one timeline export.
//!
//! Each source runs to completion even when the other fails; failures are
//! collected per resource instead of aborting the run. A report with any
//! errors is a partial success, not a failure.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::bls::{BlsApi, MirrorSource, MirrorSync};
use crate::config::Config;
use crate::datausa::{CandidateResolver, CubeApi, DatasetSync};
use crate::http::HttpClient;
use crate::models::{ScheduledRelease, SyncReport};
use crate::schedule::load_scheduled_releases;
use crate::store::ObjectStore;
use crate::timeline::{build_timeline_payload, collect_change_events, TimelinePayload};

/// Run one full sync across both sources.
#[allow(clippy::too_many_arguments)]
pub async fn run_sync(
    bls_store: &dyn ObjectStore,
    datausa_store: &dyn ObjectStore,
    mirror: &dyn MirrorSource,
    bls_api: &dyn BlsApi,
    cube_api: &dyn CubeApi,
    resolver: &CandidateResolver,
    config: &Config,
    force: bool,
) -> SyncReport {
    let mut report = SyncReport::default();

    let engine = MirrorSync::new(bls_store, mirror, bls_api, &config.bls);
    let (bls_results, bls_errors) = engine.sync_all().await;
    report.bls = bls_results;
    report.errors.extend(bls_errors);

    let engine = DatasetSync::new(datausa_store, cube_api, resolver, &config.datausa);
    let (datausa_results, datausa_errors) = engine.sync_all(force).await;
    report.datausa = datausa_results;
    report.errors.extend(datausa_errors);

    report
}

fn source_tz(config: &Config) -> Tz {
    config
        .schedule
        .time_zone
        .parse()
        .unwrap_or(chrono_tz::America::New_York)
}

/// Build the timeline document from the sync logs plus the scraped release
/// schedule, and write it to `out_path`.
pub async fn run_timeline(
    bls_store: &dyn ObjectStore,
    http: &HttpClient,
    config: &Config,
    now: DateTime<Utc>,
    out_override: Option<&Path>,
) -> Result<(TimelinePayload, PathBuf)> {
    let tz = source_tz(config);
    let events = collect_change_events(bls_store, &config.bls.series, tz).await;

    let start = now - Duration::days(config.timeline.window_days);
    let end = now + Duration::days(config.timeline.lookahead_days.max(0));
    let scheduled = load_scheduled_releases(
        http,
        &config.schedule,
        &config.bls.user_agent,
        &config.bls.series,
        start,
        end,
    )
    .await;

    let payload = build_timeline_payload(
        events,
        scheduled,
        now,
        config.timeline.window_days,
        config.timeline.lookahead_days,
        config.timeline.early_minutes,
        config.timeline.late_hours,
    );

    let path = out_override
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(&config.timeline.out_path));
    crate::timeline::write_timeline(&payload, &path)?;
    Ok((payload, path))
}

/// Scrape upcoming scheduled releases inside the forward window.
pub async fn run_schedule(
    http: &HttpClient,
    config: &Config,
    now: DateTime<Utc>,
) -> Vec<ScheduledRelease> {
    load_scheduled_releases(
        http,
        &config.schedule,
        &config.bls.user_agent,
        &config.bls.series,
        now,
        now + Duration::days(config.timeline.window_days),
    )
    .await
}
