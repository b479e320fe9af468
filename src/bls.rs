//! File-mirror sync engine (timestamp oracle).
//!
//! Synchronizes BLS LABSTAT series directories into the object store. Change
//! detection compares the mirror's "Last Modified" listing timestamp against
//! the stored fingerprint with strict greater-than semantics; the blob is
//! downloaded only when the oracle says it changed.
//!
//! The `ln` series is special-cased: the mirror does not publish
//! `ln.data.0.Current` (and the full `ln` data file is hundreds of MB), so a
//! small TSV extract is materialized from the BLS public API instead, with
//! content-hash change detection.
//!
//! Crash recovery: a run killed between blob write and state save is safe —
//! the next run re-detects the same file as changed and redoes the
//! idempotent write.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::config::{BlsApiConfig, BlsConfig};
use crate::http::{HttpClient, HttpError};
use crate::listing::{parse_directory_listing, parse_listing_timestamp, Listing};
use crate::models::{
    FileState, RemoteFile, ResourceError, SeriesState, SeriesSummary, SyncAction, SyncLogEntry,
};
use crate::state::StateStore;
use crate::store::{Metadata, ObjectStore};

const LN_SERIES: &str = "ln";
const LN_FILENAME: &str = "ln.data.0.Current";

/// Remote side of the file mirror: the directory listing and file bodies.
#[async_trait]
pub trait MirrorSource: Send + Sync {
    async fn fetch_listing(&self, series: &str) -> Result<Listing, HttpError>;
    async fn download(&self, series: &str, filename: &str) -> Result<Vec<u8>, HttpError>;
}

/// Mirror source backed by the retrying HTTP client.
pub struct HttpMirrorSource<'a> {
    http: &'a HttpClient,
    base_url: String,
    user_agent: String,
}

impl<'a> HttpMirrorSource<'a> {
    pub fn new(http: &'a HttpClient, config: &BlsConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_agent: config.user_agent.clone(),
        }
    }
}

#[async_trait]
impl MirrorSource for HttpMirrorSource<'_> {
    async fn fetch_listing(&self, series: &str) -> Result<Listing, HttpError> {
        let url = format!("{}/{series}/", self.base_url);
        let html = self
            .http
            .fetch_text(&url, &[("User-Agent", &self.user_agent)])
            .await?;
        Ok(parse_directory_listing(&html))
    }

    async fn download(&self, series: &str, filename: &str) -> Result<Vec<u8>, HttpError> {
        let url = format!("{}/{series}/{filename}", self.base_url);
        self.http
            .fetch_bytes(&url, &[("User-Agent", &self.user_agent)])
            .await
    }
}

/// One row fetched from the BLS public API, normalized to the TSV schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRow {
    pub series_id: String,
    pub year: String,
    pub period: String,
    pub value: String,
    pub footnote_codes: String,
}

/// Remote side of the BLS public API (for the `ln` extract).
#[async_trait]
pub trait BlsApi: Send + Sync {
    async fn fetch_rows(
        &self,
        series_ids: &[String],
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<ApiRow>>;
}

/// BLS public API client over the retrying HTTP client.
pub struct HttpBlsApi<'a> {
    http: &'a HttpClient,
    config: &'a BlsApiConfig,
    user_agent: String,
}

impl<'a> HttpBlsApi<'a> {
    pub fn new(http: &'a HttpClient, config: &'a BlsConfig) -> Self {
        Self {
            http,
            config: &config.api,
            user_agent: config.user_agent.clone(),
        }
    }
}

#[async_trait]
impl BlsApi for HttpBlsApi<'_> {
    async fn fetch_rows(
        &self,
        series_ids: &[String],
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<ApiRow>> {
        let mut payload = serde_json::json!({
            "seriesid": series_ids,
            "startyear": start_year.to_string(),
            "endyear": end_year.to_string(),
        });
        if let Some(key) = &self.config.api_key {
            payload["registrationKey"] = Value::String(key.clone());
        }

        let response = self
            .http
            .post_json(
                &self.config.base_url,
                &payload,
                &[("User-Agent", &self.user_agent)],
            )
            .await
            .context("BLS API request failed")?;
        parse_api_rows(&response)
    }
}

/// Normalize a BLS API response into TSV-schema rows.
///
/// Tolerates missing/odd-typed fields per record but requires the overall
/// request to have succeeded.
pub fn parse_api_rows(response: &Value) -> Result<Vec<ApiRow>> {
    let status = response
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if status != "REQUEST_SUCCEEDED" {
        let message = response.get("message").cloned().unwrap_or(Value::Null);
        anyhow::bail!("BLS API request failed: status={status} message={message}");
    }

    let series_list = response
        .get("Results")
        .and_then(|r| r.get("series"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut out = Vec::new();
    for series in &series_list {
        let series_id = series
            .get("seriesID")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let Some(points) = series.get("data").and_then(Value::as_array) else {
            continue;
        };
        if series_id.is_empty() {
            continue;
        }

        for point in points {
            let field = |name: &str| -> String {
                match point.get(name) {
                    Some(Value::String(s)) => s.trim().to_string(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => String::new(),
                }
            };
            let year = field("year");
            let period = field("period");
            if year.is_empty() || period.is_empty() {
                continue;
            }

            // Footnotes come back as a list of {"code": "..."} objects.
            let codes: Vec<String> = point
                .get("footnotes")
                .and_then(Value::as_array)
                .map(|fns| {
                    fns.iter()
                        .filter_map(|f| f.get("code").and_then(Value::as_str))
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .collect()
                })
                .unwrap_or_default();

            out.push(ApiRow {
                series_id: series_id.clone(),
                year,
                period,
                value: field("value"),
                footnote_codes: codes.join(","),
            });
        }
    }
    Ok(out)
}

/// Timestamp change oracle: has the remote file changed since the stored
/// fingerprint?
///
/// Strict greater-than; with no stored fingerprint (or a stored entry that
/// carries no timestamp) the answer is always yes.
pub fn needs_update(source_time: NaiveDateTime, stored: Option<&FileState>) -> bool {
    match stored.and_then(|s| s.source_modified) {
        Some(last) => source_time > last,
        None => true,
    }
}

/// Split `[start_year, end_year]` into chunks of at most `max_years` years.
pub fn year_chunks(start_year: i32, end_year: i32, max_years: i32) -> Vec<(i32, i32)> {
    let max_years = if max_years <= 0 { 20 } else { max_years };
    let mut out = Vec::new();
    let mut cur = start_year;
    while cur <= end_year {
        let chunk_end = end_year.min(cur + max_years - 1);
        out.push((cur, chunk_end));
        cur = chunk_end + 1;
    }
    out
}

fn render_tsv(rows: &[ApiRow]) -> Vec<u8> {
    let mut out = String::from("series_id\tyear\tperiod\tvalue\tfootnote_codes\n");
    for row in rows {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\n",
            row.series_id, row.year, row.period, row.value, row.footnote_codes
        ));
    }
    out.into_bytes()
}

fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())[..16].to_string()
}

fn build_globset(patterns: &[String], series: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let expanded = pattern.replace("{series}", series);
        builder.add(Glob::new(&expanded).with_context(|| format!("bad pattern {pattern:?}"))?);
    }
    Ok(builder.build()?)
}

/// The file-mirror sync engine.
pub struct MirrorSync<'a> {
    store: &'a dyn ObjectStore,
    source: &'a dyn MirrorSource,
    api: &'a dyn BlsApi,
    config: &'a BlsConfig,
}

impl<'a> MirrorSync<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        source: &'a dyn MirrorSource,
        api: &'a dyn BlsApi,
        config: &'a BlsConfig,
    ) -> Self {
        Self {
            store,
            source,
            api,
            config,
        }
    }

    /// Sync every configured series sequentially, pausing between series.
    ///
    /// A failing series never aborts its siblings; failures are collected as
    /// `(resource, error)` pairs.
    pub async fn sync_all(&self) -> (BTreeMap<String, SeriesSummary>, Vec<ResourceError>) {
        let mut results = BTreeMap::new();
        let mut errors = Vec::new();

        for (i, series) in self.config.series.iter().enumerate() {
            match self.sync_series(series).await {
                Ok(summary) => {
                    tracing::info!(
                        series,
                        added = summary.added.len(),
                        updated = summary.updated.len(),
                        unchanged = summary.unchanged.len(),
                        deleted = summary.deleted.len(),
                        "series sync complete"
                    );
                    results.insert(series.clone(), summary);
                }
                Err(e) => {
                    tracing::warn!(series, error = %e, "series sync failed");
                    errors.push(ResourceError {
                        resource: series.clone(),
                        error: format!("{e:#}"),
                    });
                }
            }
            if self.config.series_delay_secs > 0.0 && i + 1 < self.config.series.len() {
                tokio::time::sleep(std::time::Duration::from_secs_f64(
                    self.config.series_delay_secs,
                ))
                .await;
            }
        }

        (results, errors)
    }

    /// Sync a single series and return the per-action summary.
    pub async fn sync_series(&self, series: &str) -> Result<SeriesSummary> {
        if series.trim().eq_ignore_ascii_case(LN_SERIES) {
            return self.sync_ln_via_api().await;
        }

        let listing = self
            .source
            .fetch_listing(series)
            .await
            .with_context(|| format!("fetch directory listing for series '{series}'"))?;
        if listing.skipped_rows > 0 {
            tracing::warn!(
                series,
                skipped = listing.skipped_rows,
                "unparseable listing rows skipped"
            );
        }
        // An empty listing is indistinguishable from a broken mirror page;
        // surfacing it beats silently deleting every known file.
        if listing.files.is_empty() {
            anyhow::bail!("directory listing for series '{series}' is empty");
        }

        let include = build_globset(&self.config.file_patterns, series)?;
        let states = StateStore::new(self.store);
        let mut state = states.load_series(series).await;
        let now = Utc::now();

        let known: BTreeSet<String> = state.files.keys().cloned().collect();
        let remote: HashSet<&str> = listing.files.iter().map(|f| f.filename.as_str()).collect();
        let mut summary = SeriesSummary::default();

        for file in &listing.files {
            if !include.is_match(&file.filename) {
                continue;
            }
            self.sync_file(series, file, &known, &mut state, &mut summary, &states, now)
                .await?;
        }

        // Deletion signal is the remote listing, not the store.
        let deleted: Vec<String> = known
            .iter()
            .filter(|name| !remote.contains(name.as_str()))
            .cloned()
            .collect();
        for filename in deleted {
            let key = format!("{series}/{filename}");
            let mut entry = SyncLogEntry::new(series, &filename, SyncAction::Deleted, now);
            if let Err(e) = self.store.delete(&key).await {
                tracing::warn!(series, file = %filename, error = %e, "best-effort blob delete failed");
                entry.delete_error = Some(format!("{e:#}"));
            }
            state.files.remove(&filename);
            summary.push(SyncAction::Deleted, &filename);
            states.append_log(series, &entry).await?;
        }

        state.last_sync = Some(now);
        states.save_series(&state).await?;
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_file(
        &self,
        series: &str,
        file: &RemoteFile,
        known: &BTreeSet<String>,
        state: &mut SeriesState,
        summary: &mut SeriesSummary,
        states: &StateStore<'_>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let source_time = parse_listing_timestamp(&file.timestamp)
            .with_context(|| format!("series '{series}' file '{}'", file.filename))?;

        let mut entry = SyncLogEntry::new(series, &file.filename, SyncAction::Unchanged, now);
        entry.source_modified = Some(source_time);

        if needs_update(source_time, state.files.get(&file.filename)) {
            let body = self
                .source
                .download(series, &file.filename)
                .await
                .with_context(|| format!("download {series}/{}", file.filename))?;

            let key = format!("{series}/{}", file.filename);
            let mut metadata = Metadata::new();
            metadata.insert(
                "source_modified".to_string(),
                source_time.format("%Y-%m-%dT%H:%M:%S").to_string(),
            );
            self.store.put(&key, &body, &metadata).await?;

            let action = if known.contains(&file.filename) {
                SyncAction::Updated
            } else {
                SyncAction::Added
            };
            entry.action = action;
            entry.bytes = Some(body.len() as u64);
            summary.push(action, &file.filename);
            state.files.insert(
                file.filename.clone(),
                FileState {
                    source_modified: Some(source_time),
                    content_hash: None,
                    bytes: body.len() as u64,
                },
            );
        } else {
            summary.push(SyncAction::Unchanged, &file.filename);
        }

        states.append_log(series, &entry).await
    }

    /// Materialize the `ln` extract from the BLS public API.
    ///
    /// The extract is a small TSV at `ln/ln.data.0.Current` covering only the
    /// configured series ids; change detection is by content hash.
    async fn sync_ln_via_api(&self) -> Result<SeriesSummary> {
        let api = &self.config.api;
        let now = Utc::now();
        let end_year = api.end_year.unwrap_or(now.year());
        let max_years = match api.max_years_per_request {
            Some(n) => {
                // Without an API key the service may only return ~10 years
                // regardless of the requested range; clamp so mid-range years
                // are not silently missed.
                if api.api_key.is_none() {
                    n.min(10)
                } else {
                    n
                }
            }
            None if api.api_key.is_some() => 20,
            None => 10,
        };

        let mut seen: HashSet<(String, String, String)> = HashSet::new();
        let mut rows: Vec<ApiRow> = Vec::new();
        for (y0, y1) in year_chunks(api.start_year, end_year, max_years) {
            for row in self.api.fetch_rows(&api.series_ids, y0, y1).await? {
                let key = (row.series_id.clone(), row.year.clone(), row.period.clone());
                if seen.insert(key) {
                    rows.push(row);
                }
            }
        }

        // Stable ordering for deterministic hashes.
        rows.sort_by(|a, b| {
            let ay = a.year.parse::<i64>().unwrap_or(0);
            let by = b.year.parse::<i64>().unwrap_or(0);
            (&a.series_id, ay, &a.period).cmp(&(&b.series_id, by, &b.period))
        });

        let body = render_tsv(&rows);
        let content_hash = hash_bytes(&body);
        let key = format!("{LN_SERIES}/{LN_FILENAME}");

        let states = StateStore::new(self.store);
        let mut summary = SeriesSummary::default();

        let existing = self.store.head(&key).await.unwrap_or(None);
        if existing
            .as_ref()
            .and_then(|m| m.get("content_hash"))
            .is_some_and(|h| *h == content_hash)
        {
            summary.push(SyncAction::Unchanged, LN_FILENAME);
            let mut entry = SyncLogEntry::new(LN_SERIES, LN_FILENAME, SyncAction::Unchanged, now);
            entry.content_hash = Some(content_hash);
            states.append_log(LN_SERIES, &entry).await?;
            return Ok(summary);
        }

        let mut state = states.load_series(LN_SERIES).await;
        let action = if state.files.contains_key(LN_FILENAME) {
            SyncAction::Updated
        } else {
            SyncAction::Added
        };

        let mut metadata = Metadata::new();
        metadata.insert("content_hash".to_string(), content_hash.clone());
        metadata.insert("source".to_string(), "bls_api".to_string());
        metadata.insert("fetched_at".to_string(), now.to_rfc3339());
        self.store.put(&key, &body, &metadata).await?;

        summary.push(action, LN_FILENAME);
        let mut entry = SyncLogEntry::new(LN_SERIES, LN_FILENAME, action, now);
        entry.content_hash = Some(content_hash.clone());
        entry.bytes = Some(body.len() as u64);
        states.append_log(LN_SERIES, &entry).await?;

        state.files.insert(
            LN_FILENAME.to_string(),
            FileState {
                source_modified: None,
                content_hash: Some(content_hash),
                bytes: body.len() as u64,
            },
        );
        state.last_sync = Some(now);
        states.save_series(&state).await?;

        Ok(summary)
    }
}
