//! # fedsync CLI
//!
//! Commands for running the sync pipeline and exporting the change timeline.
//!
//! ```bash
//! fedsync --config ./config/fedsync.toml sync
//! fedsync timeline --out site/data/timeline.json
//! fedsync schedule
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fedsync sync` | Sync all configured BLS series and DataUSA datasets |
//! | `fedsync timeline` | Build and write the change-timeline JSON document |
//! | `fedsync schedule` | Print upcoming scheduled releases |
//!
//! `sync` exits non-zero when any resource failed, even if the rest of the
//! run succeeded; the JSON report on stdout carries the per-resource errors.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fedsync::bls::{HttpBlsApi, HttpMirrorSource};
use fedsync::config::{load_config, Config};
use fedsync::datausa::{CandidateResolver, DatasetSync, HttpCubeApi};
use fedsync::http::HttpClient;
use fedsync::pipeline;
use fedsync::store_s3::S3Store;

/// fedsync — incremental sync and change detection for BLS and DataUSA
/// economic data.
#[derive(Parser)]
#[command(
    name = "fedsync",
    about = "Incremental sync and change detection for BLS and DataUSA economic data",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fedsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync all configured BLS series and DataUSA datasets.
    ///
    /// Every resource runs even when a sibling fails; the run exits non-zero
    /// if any resource ended in error.
    Sync {
        /// Bypass the DataUSA minimum-sync-interval skip.
        #[arg(long)]
        force: bool,

        /// Only sync these BLS series (comma-separated, e.g. `pr,cu`).
        #[arg(long, value_delimiter = ',')]
        series: Vec<String>,

        /// Only sync these DataUSA dataset ids (comma-separated).
        #[arg(long, value_delimiter = ',')]
        datasets: Vec<String>,
    },

    /// Build the change timeline from the sync logs and write it as JSON.
    ///
    /// Combines recent change events with the scraped release schedule and
    /// matches scheduled releases to observed change bursts.
    Timeline {
        /// Output path; overrides `timeline.out_path` from the config.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Fetch and print upcoming scheduled releases.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let http = HttpClient::new(config.http.retry_policy());

    match cli.command {
        Commands::Sync {
            force,
            series,
            datasets,
        } => {
            let mut config = config;
            if !series.is_empty() {
                config.bls.series.retain(|s| series.contains(s));
            }
            if !datasets.is_empty() {
                config.datausa.datasets.retain(|d| datasets.contains(&d.id));
            }
            run_sync(&config, &http, force).await
        }
        Commands::Timeline { out } => {
            let bls_store = S3Store::connect(&config.store.bls_bucket, &config.store)?;
            let (payload, path) =
                pipeline::run_timeline(&bls_store, &http, &config, Utc::now(), out.as_deref())
                    .await?;
            tracing::info!(
                events = payload.events.len(),
                releases = payload.releases.len(),
                path = %path.display(),
                "timeline written"
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Schedule => {
            let releases = pipeline::run_schedule(&http, &config, Utc::now()).await;
            println!("{}", serde_json::to_string_pretty(&releases)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_sync(config: &Config, http: &HttpClient, force: bool) -> Result<ExitCode> {
    let bls_store = S3Store::connect(&config.store.bls_bucket, &config.store)?;
    let datausa_store = S3Store::connect(&config.store.datausa_bucket, &config.store)?;

    let mirror = HttpMirrorSource::new(http, &config.bls);
    let bls_api = HttpBlsApi::new(http, &config.bls);
    let cube_api = HttpCubeApi::new(http, &config.datausa);
    let resolver = CandidateResolver::new();

    // Resolve query shapes up front with cheap probes so the full fetches
    // start from known-good shapes.
    DatasetSync::new(&datausa_store, &cube_api, &resolver, &config.datausa)
        .validate_candidates()
        .await;

    let report = pipeline::run_sync(
        &bls_store,
        &datausa_store,
        &mirror,
        &bls_api,
        &cube_api,
        &resolver,
        config,
        force,
    )
    .await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.is_partial() {
        tracing::warn!(errors = report.errors.len(), "sync finished with errors");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}
