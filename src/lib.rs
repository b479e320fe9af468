//! # fedsync
//!
//! Incremental sync and change detection for two public economic-data
//! sources: the BLS LABSTAT file mirror and the DataUSA statistical-cube
//! API. Raw payloads land in S3-compatible object storage; every observed
//! transition is journaled so a change timeline can be rebuilt at any time.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │  BLS mirror  │   │ DataUSA API  │
//! │  (listings)  │   │ (JSON cubes) │
//! └──────┬───────┘   └──────┬───────┘
//!        ▼                  ▼
//! ┌──────────────────────────────────┐
//! │ sync engines (timestamp / hash)  │
//! └──────┬──────────────────┬────────┘
//!        ▼                  ▼
//! ┌──────────────┐   ┌──────────────┐
//! │ object store │   │  sync state  │
//! │  (raw blobs) │   │  + log jsonl │
//! └──────────────┘   └──────┬───────┘
//!                           ▼
//!                    ┌──────────────┐
//!                    │   timeline   │
//!                    │ (JSON export)│
//!                    └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`http`] | Retrying HTTP client |
//! | [`store`] | Object store abstraction |
//! | [`store_s3`] | S3 REST backend (SigV4) |
//! | [`listing`] | Mirror directory-listing parser |
//! | [`state`] | Durable sync state and the sync log |
//! | [`bls`] | File-mirror sync engine (timestamp oracle) |
//! | [`datausa`] | Cube-API sync engine (content-hash oracle) |
//! | [`schedule`] | Release-schedule page scraper |
//! | [`timeline`] | Change timeline and release reconciliation |
//! | [`pipeline`] | Top-level orchestration |

pub mod bls;
pub mod config;
pub mod datausa;
pub mod http;
pub mod listing;
pub mod models;
pub mod pipeline;
pub mod schedule;
pub mod state;
pub mod store;
pub mod store_s3;
pub mod timeline;
