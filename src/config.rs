use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::http::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub bls: BlsConfig,
    #[serde(default)]
    pub datausa: DatausaConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub timeline: TimelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Bucket for raw mirror files and their sync state.
    pub bls_bucket: String,
    /// Bucket for API dataset payloads and their sync state.
    pub datausa_bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff")]
    pub backoff_seconds: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            retries: default_retries(),
            backoff_seconds: default_backoff(),
            max_backoff_seconds: default_max_backoff(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl HttpConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            backoff_seconds: self.backoff_seconds,
            max_backoff_seconds: self.max_backoff_seconds,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

fn default_retries() -> u32 {
    3
}
fn default_backoff() -> f64 {
    1.0
}
fn default_max_backoff() -> f64 {
    60.0
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlsConfig {
    /// Series ids to mirror (e.g. `pr`, `cu`). `ln` is served from the BLS
    /// API instead of the file mirror.
    #[serde(default)]
    pub series: Vec<String>,
    #[serde(default = "default_bls_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Glob inclusion filters; `{series}` expands to the series id. The
    /// default bounds bandwidth to the one file downstream expects.
    #[serde(default = "default_file_patterns")]
    pub file_patterns: Vec<String>,
    /// Politeness pause between series.
    #[serde(default = "default_series_delay")]
    pub series_delay_secs: f64,
    #[serde(default)]
    pub api: BlsApiConfig,
}

impl Default for BlsConfig {
    fn default() -> Self {
        Self {
            series: Vec::new(),
            base_url: default_bls_base_url(),
            user_agent: default_user_agent(),
            file_patterns: default_file_patterns(),
            series_delay_secs: default_series_delay(),
            api: BlsApiConfig::default(),
        }
    }
}

fn default_bls_base_url() -> String {
    "https://download.bls.gov/pub/time.series".to_string()
}
fn default_user_agent() -> String {
    "fedsync/0.3 (data-pipeline)".to_string()
}
fn default_file_patterns() -> Vec<String> {
    vec!["{series}.data.0.Current".to_string()]
}
fn default_series_delay() -> f64 {
    2.0
}

/// Settings for the BLS public API, used for the `ln` extract.
#[derive(Debug, Deserialize, Clone)]
pub struct BlsApiConfig {
    #[serde(default = "default_bls_api_url")]
    pub base_url: String,
    /// Series materialized into the `ln` extract.
    #[serde(default = "default_ln_series_ids")]
    pub series_ids: Vec<String>,
    #[serde(default = "default_start_year")]
    pub start_year: i32,
    /// Defaults to the current year when unset.
    #[serde(default)]
    pub end_year: Option<i32>,
    /// Years per request. Unset: 20 with an API key, 10 without (the API
    /// silently truncates unregistered requests to ~10 years).
    #[serde(default)]
    pub max_years_per_request: Option<i32>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for BlsApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_bls_api_url(),
            series_ids: default_ln_series_ids(),
            start_year: default_start_year(),
            end_year: None,
            max_years_per_request: None,
            api_key: None,
        }
    }
}

fn default_bls_api_url() -> String {
    "https://api.bls.gov/publicAPI/v2/timeseries/data/".to_string()
}
fn default_ln_series_ids() -> Vec<String> {
    vec!["LNS14000000".to_string(), "LNS11300000".to_string()]
}
fn default_start_year() -> i32 {
    2005
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatausaConfig {
    #[serde(default = "default_datausa_base_url")]
    pub base_url: String,
    /// Fetches are skipped entirely when the last sync is younger than this,
    /// unless forced. Rate-limit protection, not a correctness mechanism.
    #[serde(default = "default_min_sync_interval")]
    pub min_sync_interval_secs: u64,
    #[serde(default)]
    pub datasets: Vec<DatasetConfig>,
}

impl Default for DatausaConfig {
    fn default() -> Self {
        Self {
            base_url: default_datausa_base_url(),
            min_sync_interval_secs: default_min_sync_interval(),
            datasets: Vec::new(),
        }
    }
}

fn default_datausa_base_url() -> String {
    "https://honolulu-api.datausa.io/tesseract/data.jsonrecords".to_string()
}
fn default_min_sync_interval() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetConfig {
    /// Dataset id; also the primary cube name.
    pub id: String,
    /// Object-store key override. Defaults to `<id>.json`.
    #[serde(default)]
    pub key: Option<String>,
    /// Explicit candidate query shapes, primary first. When empty, built-in
    /// schema-drift fallbacks for the cube are used.
    #[serde(default)]
    pub candidates: Vec<QueryShapeConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryShapeConfig {
    pub cube: String,
    pub drilldowns: Vec<String>,
    pub measures: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    /// Timezone the schedule pages render times in.
    #[serde(default = "default_schedule_tz")]
    pub time_zone: String,
    /// Per-series overrides; merged over the built-in sources.
    #[serde(default)]
    pub sources: BTreeMap<String, ScheduleSourceConfig>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            time_zone: default_schedule_tz(),
            sources: BTreeMap::new(),
        }
    }
}

fn default_schedule_tz() -> String {
    "America/New_York".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleSourceConfig {
    pub url: String,
    #[serde(default)]
    pub release: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimelineConfig {
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    #[serde(default)]
    pub lookahead_days: i64,
    /// A release is never expected meaningfully before its announced time.
    #[serde(default = "default_early_minutes")]
    pub early_minutes: i64,
    /// Day-scale delays are common and should still match.
    #[serde(default = "default_late_hours")]
    pub late_hours: i64,
    #[serde(default = "default_timeline_out")]
    pub out_path: String,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            lookahead_days: 0,
            early_minutes: default_early_minutes(),
            late_hours: default_late_hours(),
            out_path: default_timeline_out(),
        }
    }
}

fn default_window_days() -> i64 {
    60
}
fn default_early_minutes() -> i64 {
    15
}
fn default_late_hours() -> i64 {
    24
}
fn default_timeline_out() -> String {
    "site/data/timeline.json".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.store.bls_bucket.trim().is_empty() {
        anyhow::bail!("store.bls_bucket must not be empty");
    }
    if config.store.datausa_bucket.trim().is_empty() {
        anyhow::bail!("store.datausa_bucket must not be empty");
    }

    if config.http.retries == 0 {
        anyhow::bail!("http.retries must be >= 1");
    }
    if config.http.backoff_seconds < 0.0 {
        anyhow::bail!("http.backoff_seconds must be >= 0");
    }

    if config.bls.file_patterns.iter().any(|p| p.trim().is_empty()) {
        anyhow::bail!("bls.file_patterns must not contain empty patterns");
    }
    if config.bls.series_delay_secs < 0.0 {
        anyhow::bail!("bls.series_delay_secs must be >= 0");
    }

    for dataset in &config.datausa.datasets {
        if dataset.id.trim().is_empty() {
            anyhow::bail!("datausa.datasets entries must have a non-empty id");
        }
    }

    if config.timeline.window_days < 1 {
        anyhow::bail!("timeline.window_days must be >= 1");
    }
    if config.timeline.early_minutes < 0 {
        anyhow::bail!("timeline.early_minutes must be >= 0");
    }
    if config.timeline.late_hours < 1 {
        anyhow::bail!("timeline.late_hours must be >= 1");
    }

    config
        .schedule
        .time_zone
        .parse::<chrono_tz::Tz>()
        .map_err(|_| anyhow::anyhow!("Unknown schedule.time_zone: '{}'", config.schedule.time_zone))?;

    Ok(config)
}
