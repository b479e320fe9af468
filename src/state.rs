//! Durable sync state and the append-only sync log.
//!
//! Both live under `_sync_state/<resource>/` in the object store:
//!
//! - `latest_state.json` (series) / `latest_state.jsonl` (datasets) — the
//!   per-resource state snapshot. Dataset payload blobs end in `.json` and
//!   feed an object-created notification filter keyed on that suffix, so the
//!   dataset state object must carry a suffix the filter ignores.
//! - `sync_log.jsonl` — newline-delimited journal, one entry per observed
//!   transition, never rewritten.
//!
//! Saves are atomic from a reader's perspective: the serialized state goes to
//! a temp key first, then a copy mutates the canonical key. A crash between
//! copy and delete leaves an orphan temp object that no read path touches.
//!
//! The log append is read-modify-write (the store has no append primitive)
//! and is safe only under single-writer-per-resource execution.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::{DatasetState, SeriesState, SyncLogEntry};
use crate::store::{Metadata, ObjectStore};

const STATE_PREFIX: &str = "_sync_state";

pub fn series_state_key(series: &str) -> String {
    format!("{STATE_PREFIX}/{series}/latest_state.json")
}

pub fn dataset_state_key(dataset: &str) -> String {
    format!("{STATE_PREFIX}/{dataset}/latest_state.jsonl")
}

pub fn sync_log_key(resource: &str) -> String {
    format!("{STATE_PREFIX}/{resource}/sync_log.jsonl")
}

fn temp_key(canonical: &str) -> String {
    match canonical.rsplit_once('/') {
        Some((dir, name)) => format!("{dir}/_tmp_{name}"),
        None => format!("_tmp_{canonical}"),
    }
}

/// State store + sync log over an [`ObjectStore`].
pub struct StateStore<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> StateStore<'a> {
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self { store }
    }

    /// Load series state; any read or parse failure yields the empty state.
    pub async fn load_series(&self, series: &str) -> SeriesState {
        self.load_or_default(&series_state_key(series), || SeriesState::empty(series))
            .await
    }

    pub async fn save_series(&self, state: &SeriesState) -> Result<()> {
        self.save(&series_state_key(&state.series), state).await
    }

    /// Load dataset state; any read or parse failure yields the empty state.
    pub async fn load_dataset(&self, dataset: &str) -> DatasetState {
        self.load_or_default(&dataset_state_key(dataset), || DatasetState::empty(dataset))
            .await
    }

    pub async fn save_dataset(&self, state: &DatasetState) -> Result<()> {
        self.save(&dataset_state_key(&state.dataset), state).await
    }

    /// Append one entry to the resource's sync log.
    pub async fn append_log(&self, resource: &str, entry: &SyncLogEntry) -> Result<()> {
        let key = sync_log_key(resource);
        let mut body = self.store.get(&key).await.unwrap_or(None).unwrap_or_default();
        let line = serde_json::to_string(entry).context("serialize sync log entry")?;
        body.extend_from_slice(line.as_bytes());
        body.push(b'\n');
        self.store
            .put(&key, &body, &Metadata::new())
            .await
            .with_context(|| format!("write sync log {key}"))
    }

    /// Read the full sync log for a resource.
    ///
    /// Malformed lines are skipped individually; a missing log is empty.
    pub async fn read_log(&self, resource: &str) -> Result<Vec<SyncLogEntry>> {
        let key = sync_log_key(resource);
        let body = match self.store.get(&key).await? {
            Some(body) => body,
            None => return Ok(Vec::new()),
        };
        let text = String::from_utf8_lossy(&body);

        let mut entries = Vec::new();
        let mut bad_lines = 0usize;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<SyncLogEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(_) => bad_lines += 1,
            }
        }
        if bad_lines > 0 {
            tracing::warn!(resource, bad_lines, "skipped malformed sync log lines");
        }
        Ok(entries)
    }

    async fn load_or_default<T, F>(&self, key: &str, default: F) -> T
    where
        T: DeserializeOwned,
        F: FnOnce() -> T,
    {
        match self.store.get(key).await {
            Ok(Some(body)) => match serde_json::from_slice(&body) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(key, error = %e, "state blob corrupt, using default");
                    default()
                }
            },
            Ok(None) => default(),
            Err(e) => {
                tracing::warn!(key, error = %e, "state read failed, using default");
                default()
            }
        }
    }

    /// Write state to a temp key, then copy-then-delete onto the canonical key.
    async fn save<T: Serialize>(&self, key: &str, state: &T) -> Result<()> {
        let body = serde_json::to_vec_pretty(state).context("serialize sync state")?;
        let tmp = temp_key(key);

        self.store
            .put(&tmp, &body, &Metadata::new())
            .await
            .with_context(|| format!("write temp state {tmp}"))?;
        self.store
            .copy(&tmp, key)
            .await
            .with_context(|| format!("copy state {tmp} -> {key}"))?;
        if let Err(e) = self.store.delete(&tmp).await {
            // Orphan temp objects are acceptable garbage; nothing reads them.
            tracing::warn!(key = %tmp, error = %e, "temp state cleanup failed");
        }
        Ok(())
    }
}
