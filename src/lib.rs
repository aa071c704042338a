//! Resumable ingestion of KZ leaderboard data (records, bans, servers, maps,
//! players) from the global HTTP API into Postgres.
//!
//! The pipeline for one stream is
//! fetch (through a rotating proxy pool) → normalize → resolve entities →
//! write → checkpoint, driven by [`ingest::controller::IngestionController`].

pub mod api;
pub mod config;
pub mod database_ops;
pub mod ingest;
pub mod metrics;
pub mod normalization;
pub mod shutdown;
pub mod tracing;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use config::IngestConfig;
pub use ingest::stream::StreamKind;
pub use metrics::{CounterSnapshot, IngestCounters};
