//! Statistical-cube API sync engine (content-hash oracle).
//!
//! Fetches DataUSA tesseract datasets as JSON, detects change by hashing the
//! canonicalized payload, and lands changed payloads in the object store with
//! the same state/log bookkeeping as the mirror engine.
//!
//! Two API-specific wrinkles live here:
//!
//! - **Candidate resolution.** A dataset's exact query shape is uncertain
//!   across API versions (cube names and drilldown fields drift). Candidates
//!   are tried in order; 400/404 means "wrong shape, try the next one" while
//!   any other failure means "the service is down" and aborts immediately.
//!   The first shape that works is memoized per dataset in the in-process
//!   [`CandidateResolver`] — never persisted, so a stale shape cannot be
//!   locked in across deploys.
//! - **Minimum sync interval.** When the last sync is younger than the
//!   configured interval and no force override is set, the fetch is skipped
//!   without any remote call. Rate-limit protection, not correctness.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{DatasetConfig, DatausaConfig};
use crate::http::{HttpClient, HttpError};
use crate::models::{DatasetOutcome, ResourceError, SyncAction, SyncLogEntry};
use crate::state::StateStore;
use crate::store::{Metadata, ObjectStore};

/// Result limit used by the warm-up validation probe.
const PROBE_LIMIT: u32 = 5;

/// One concrete combination of remote query parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryShape {
    pub cube: String,
    pub drilldowns: Vec<String>,
    pub measures: Vec<String>,
}

impl std::fmt::Display for QueryShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cube={} drilldowns={} measures={}",
            self.cube,
            self.drilldowns.join(","),
            self.measures.join(",")
        )
    }
}

/// One logical dataset: id, output key, ordered candidate shapes.
#[derive(Debug, Clone)]
pub struct DatasetSpec {
    pub id: String,
    pub key: String,
    pub candidates: Vec<QueryShape>,
}

impl DatasetSpec {
    pub fn from_config(config: &DatasetConfig) -> Self {
        let mut candidates: Vec<QueryShape> = if config.candidates.is_empty() {
            default_candidates(&config.id)
        } else {
            config
                .candidates
                .iter()
                .map(|c| QueryShape {
                    cube: c.cube.clone(),
                    drilldowns: c.drilldowns.clone(),
                    measures: c.measures.clone(),
                })
                .collect()
        };
        dedup_shapes(&mut candidates);

        Self {
            id: config.id.clone(),
            key: config
                .key
                .clone()
                .unwrap_or_else(|| format!("{}.json", config.id)),
            candidates,
        }
    }
}

/// Built-in schema-drift fallbacks: the national drilldown has been renamed
/// across tesseract versions.
fn default_candidates(id: &str) -> Vec<QueryShape> {
    let population = vec!["Population".to_string()];
    vec![
        QueryShape {
            cube: id.to_string(),
            drilldowns: vec!["Year".to_string(), "Nation".to_string()],
            measures: population.clone(),
        },
        QueryShape {
            cube: id.to_string(),
            drilldowns: vec!["Year".to_string(), "Geography".to_string()],
            measures: population,
        },
    ]
}

fn dedup_shapes(shapes: &mut Vec<QueryShape>) {
    let mut seen = std::collections::HashSet::new();
    shapes.retain(|s| seen.insert(s.clone()));
}

/// All candidate query shapes were rejected by the remote.
#[derive(Debug, Error)]
#[error("all candidate query shapes rejected for dataset '{dataset}': [{}]", tried.join("; "))]
pub struct CandidateExhausted {
    pub dataset: String,
    pub tried: Vec<String>,
}

/// In-process memo of the winning shape per dataset.
///
/// Owned by the caller and passed by reference into sync calls, so the
/// memoization scope is explicit and testable.
#[derive(Default)]
pub struct CandidateResolver {
    winners: RwLock<HashMap<String, QueryShape>>,
}

impl CandidateResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn winner(&self, dataset: &str) -> Option<QueryShape> {
        self.winners.read().unwrap().get(dataset).cloned()
    }

    fn record(&self, dataset: &str, shape: &QueryShape) {
        self.winners
            .write()
            .unwrap()
            .insert(dataset.to_string(), shape.clone());
    }

    /// Candidates in try order: the remembered winner first, then the spec's
    /// list, deduplicated.
    fn ordered(&self, spec: &DatasetSpec) -> Vec<QueryShape> {
        let mut out = Vec::new();
        if let Some(winner) = self.winner(&spec.id) {
            out.push(winner);
        }
        out.extend(spec.candidates.iter().cloned());
        dedup_shapes(&mut out);
        out
    }
}

/// Remote side of the cube API.
#[async_trait]
pub trait CubeApi: Send + Sync {
    async fn fetch(&self, shape: &QueryShape, limit: Option<u32>) -> Result<Value, HttpError>;
}

/// Cube API client over the retrying HTTP client.
pub struct HttpCubeApi<'a> {
    http: &'a HttpClient,
    base_url: String,
}

impl<'a> HttpCubeApi<'a> {
    pub fn new(http: &'a HttpClient, config: &DatausaConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.clone(),
        }
    }
}

#[async_trait]
impl CubeApi for HttpCubeApi<'_> {
    async fn fetch(&self, shape: &QueryShape, limit: Option<u32>) -> Result<Value, HttpError> {
        let mut url = format!(
            "{}?cube={}&drilldowns={}&locale=en&measures={}",
            self.base_url,
            shape.cube,
            shape.drilldowns.join(","),
            shape.measures.join(",")
        );
        if let Some(limit) = limit {
            url.push_str(&format!("&limit={limit}"));
        }
        self.http.fetch_json(&url, &[]).await
    }
}

/// Fetch a dataset payload, resolving the query shape along the way.
pub async fn fetch_with_candidates(
    api: &dyn CubeApi,
    resolver: &CandidateResolver,
    spec: &DatasetSpec,
    limit: Option<u32>,
) -> Result<(Value, QueryShape)> {
    let mut tried = Vec::new();

    for shape in resolver.ordered(spec) {
        match api.fetch(&shape, limit).await {
            Ok(payload) => {
                resolver.record(&spec.id, &shape);
                return Ok((payload, shape));
            }
            // Wrong shape; the next candidate may still be right.
            Err(e) if matches!(e.status(), Some(400) | Some(404)) => {
                tracing::debug!(dataset = %spec.id, shape = %shape, status = ?e.status(), "candidate shape rejected");
                tried.push(shape.to_string());
            }
            // Service failure: trying more shapes cannot help.
            Err(e) => {
                return Err(e).with_context(|| format!("fetch dataset '{}' ({shape})", spec.id))
            }
        }
    }

    Err(CandidateExhausted {
        dataset: spec.id.clone(),
        tried,
    }
    .into())
}

/// Deterministic hash of a JSON payload: sha256 over the canonical rendering
/// (recursively sorted keys, compact separators), first 16 hex characters.
pub fn compute_content_hash(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, val)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serializes"));
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar).expect("scalar serializes")),
    }
}

/// The payload's record array (`data` field), empty when absent or mistyped.
pub fn records(payload: &Value) -> &[Value] {
    payload
        .get("data")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Well-known `Year` field of one record. Records are duck-typed; the year
/// may arrive as a number or a string.
pub fn record_year(record: &Value) -> Option<i64> {
    match record.get("Year") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Well-known `Population` measure of one record.
pub fn record_population(record: &Value) -> Option<f64> {
    match record.get("Population") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn year_range(payload: &Value) -> Option<(i64, i64)> {
    let years: Vec<i64> = records(payload).iter().filter_map(record_year).collect();
    let min = *years.iter().min()?;
    let max = *years.iter().max()?;
    Some((min, max))
}

/// The API sync engine.
pub struct DatasetSync<'a> {
    store: &'a dyn ObjectStore,
    api: &'a dyn CubeApi,
    resolver: &'a CandidateResolver,
    config: &'a DatausaConfig,
}

impl<'a> DatasetSync<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        api: &'a dyn CubeApi,
        resolver: &'a CandidateResolver,
        config: &'a DatausaConfig,
    ) -> Self {
        Self {
            store,
            api,
            resolver,
            config,
        }
    }

    /// Warm the resolver cache with a minimal-payload probe per dataset.
    ///
    /// Best effort only: a failing probe is logged and swallowed, the real
    /// fetch will re-resolve.
    pub async fn validate_candidates(&self) {
        for dataset in &self.config.datasets {
            let spec = DatasetSpec::from_config(dataset);
            match fetch_with_candidates(self.api, self.resolver, &spec, Some(PROBE_LIMIT)).await {
                Ok((_, shape)) => {
                    tracing::debug!(dataset = %spec.id, %shape, "candidate probe succeeded")
                }
                Err(e) => tracing::debug!(dataset = %spec.id, error = %e, "candidate probe failed"),
            }
        }
    }

    /// Sync every configured dataset, collecting per-dataset failures.
    pub async fn sync_all(
        &self,
        force: bool,
    ) -> (BTreeMap<String, DatasetOutcome>, Vec<ResourceError>) {
        let mut results = BTreeMap::new();
        let mut errors = Vec::new();

        for dataset in &self.config.datasets {
            let spec = DatasetSpec::from_config(dataset);
            match self.sync_dataset(&spec, force).await {
                Ok(outcome) => {
                    tracing::info!(dataset = %spec.id, action = %outcome.action, "dataset sync complete");
                    results.insert(spec.id.clone(), outcome);
                }
                Err(e) => {
                    tracing::warn!(dataset = %spec.id, error = %e, "dataset sync failed");
                    errors.push(ResourceError {
                        resource: spec.id.clone(),
                        error: format!("{e:#}"),
                    });
                }
            }
        }

        (results, errors)
    }

    /// Sync a single dataset and report the action taken.
    pub async fn sync_dataset(&self, spec: &DatasetSpec, force: bool) -> Result<DatasetOutcome> {
        let states = StateStore::new(self.store);
        let mut state = states.load_dataset(&spec.id).await;
        let now = Utc::now();

        if !force && self.config.min_sync_interval_secs > 0 {
            if let Some(last_sync) = state.last_sync {
                let min_interval = Duration::seconds(self.config.min_sync_interval_secs as i64);
                if now - last_sync < min_interval {
                    tracing::debug!(dataset = %spec.id, "within minimum sync interval, skipping fetch");
                    let entry = SyncLogEntry::new(&spec.id, &spec.key, SyncAction::Skipped, now);
                    states.append_log(&spec.id, &entry).await?;
                    return Ok(DatasetOutcome {
                        action: SyncAction::Skipped,
                        key: spec.key.clone(),
                        content_hash: state.content_hash,
                        record_count: state.record_count,
                        year_range: state.year_range,
                    });
                }
            }
        }

        let (payload, _shape) = fetch_with_candidates(self.api, self.resolver, spec, None).await?;
        let content_hash = compute_content_hash(&payload);

        let stored_hash = self
            .store
            .head(&spec.key)
            .await
            .unwrap_or(None)
            .and_then(|m| m.get("content_hash").cloned());

        if stored_hash.as_deref() == Some(content_hash.as_str()) {
            let mut entry = SyncLogEntry::new(&spec.id, &spec.key, SyncAction::Unchanged, now);
            entry.content_hash = Some(content_hash.clone());
            states.append_log(&spec.id, &entry).await?;

            // Refresh last_sync so the minimum-interval policy sees this run.
            state.last_sync = Some(now);
            states.save_dataset(&state).await?;

            return Ok(DatasetOutcome {
                action: SyncAction::Unchanged,
                key: spec.key.clone(),
                content_hash: Some(content_hash),
                record_count: state.record_count,
                year_range: state.year_range,
            });
        }

        let body = serde_json::to_vec_pretty(&payload).context("serialize dataset payload")?;
        let mut metadata = Metadata::new();
        metadata.insert("content_hash".to_string(), content_hash.clone());
        metadata.insert("fetched_at".to_string(), now.to_rfc3339());
        self.store.put(&spec.key, &body, &metadata).await?;

        let record_count = records(&payload).len() as u64;
        let range = year_range(&payload);

        state.last_sync = Some(now);
        state.content_hash = Some(content_hash.clone());
        state.record_count = Some(record_count);
        state.year_range = range;
        states.save_dataset(&state).await?;

        let mut entry = SyncLogEntry::new(&spec.id, &spec.key, SyncAction::Updated, now);
        entry.content_hash = Some(content_hash.clone());
        entry.bytes = Some(body.len() as u64);
        states.append_log(&spec.id, &entry).await?;

        Ok(DatasetOutcome {
            action: SyncAction::Updated,
            key: spec.key.clone(),
            content_hash: Some(content_hash),
            record_count: Some(record_count),
            year_range: range,
        })
    }
}
