//! Run configuration: environment first, CLI flags override.

use crate::api::fetcher::RetryPolicy;
use crate::ingest::stream::StreamKind;
use crate::util::env::{env_flag, env_list, env_opt, env_parse};
use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "https://kztimerglobal.com/api/v2.0";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub api_base: String,
    pub streams: Vec<StreamKind>,
    /// Ids per window (by-id) or rows per page (paged).
    pub batch_size: usize,
    pub batch_delay: Duration,
    /// Overrides the stored cursor when set.
    pub start: Option<i64>,
    /// Exclusive final cursor.
    pub end: Option<i64>,
    pub dry_run: bool,
    pub force_refresh: bool,
    /// File checkpoints in this directory; the checkpoint table otherwise.
    pub checkpoint_dir: Option<PathBuf>,
    pub proxies: Vec<String>,
    /// Extra query parameters sent with every request.
    pub filters: Vec<(String, String)>,
    pub retry: RetryPolicy,
    /// First delay of the batch-level retry after a storage or fetch failure.
    pub batch_backoff: Duration,
    pub max_backoff: Duration,
    pub summary_interval: Duration,
    pub db_max_conns: u32,
    pub auto_migrate: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            streams: vec![StreamKind::Records],
            batch_size: 100,
            batch_delay: Duration::from_millis(1000),
            start: None,
            end: None,
            dry_run: false,
            force_refresh: false,
            checkpoint_dir: None,
            proxies: Vec::new(),
            filters: Vec::new(),
            retry: RetryPolicy::default(),
            batch_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
            summary_interval: Duration::from_secs(30),
            db_max_conns: 10,
            auto_migrate: false,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let streams = match env_opt("INGEST_STREAMS") {
            Some(raw) => parse_streams(&raw)?,
            None => d.streams,
        };
        let retry = RetryPolicy::from_env();
        Ok(Self {
            api_base: env_opt("KZ_API_BASE").unwrap_or(d.api_base),
            streams,
            batch_size: env_parse("INGEST_BATCH_SIZE", d.batch_size).max(1),
            batch_delay: Duration::from_millis(env_parse(
                "INGEST_BATCH_DELAY_MS",
                d.batch_delay.as_millis() as u64,
            )),
            start: env_opt("INGEST_START").and_then(|s| s.trim().parse().ok()),
            end: env_opt("INGEST_END").and_then(|s| s.trim().parse().ok()),
            dry_run: env_flag("INGEST_DRY_RUN", false),
            force_refresh: env_flag("INGEST_FORCE_REFRESH", false),
            checkpoint_dir: env_opt("INGEST_CHECKPOINT_DIR").map(PathBuf::from),
            proxies: env_list("KZ_PROXIES"),
            filters: env_list("KZ_API_FILTERS")
                .iter()
                .filter_map(|kv| parse_filter(kv))
                .collect(),
            batch_backoff: Duration::from_millis(env_parse(
                "INGEST_BATCH_BACKOFF_MS",
                d.batch_backoff.as_millis() as u64,
            )),
            max_backoff: retry.max_backoff,
            summary_interval: Duration::from_secs(env_parse(
                "INGEST_SUMMARY_SECS",
                d.summary_interval.as_secs(),
            )),
            db_max_conns: env_parse("DB_MAX_CONNS", d.db_max_conns).max(1),
            auto_migrate: env_flag("AUTO_MIGRATE", false),
            retry,
        })
    }
}

/// Comma separated stream names, or `all`.
pub fn parse_streams(raw: &str) -> Result<Vec<StreamKind>> {
    if raw.trim().eq_ignore_ascii_case("all") {
        return Ok(StreamKind::ALL.to_vec());
    }
    let mut out = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let kind: StreamKind = part.parse()?;
        if !out.contains(&kind) {
            out.push(kind);
        }
    }
    if out.is_empty() {
        anyhow::bail!("no streams selected");
    }
    Ok(out)
}

/// `key=value` → pair; anything else is ignored.
pub fn parse_filter(raw: &str) -> Option<(String, String)> {
    let (k, v) = raw.split_once('=')?;
    let (k, v) = (k.trim(), v.trim());
    (!k.is_empty()).then(|| (k.to_string(), v.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stream_lists() {
        assert_eq!(parse_streams("all").unwrap().len(), 5);
        assert_eq!(
            parse_streams("records, bans,records").unwrap(),
            vec![StreamKind::Records, StreamKind::Bans]
        );
        assert!(parse_streams("records,nope").is_err());
        assert!(parse_streams(" , ").is_err());
    }

    #[test]
    fn parses_filters() {
        assert_eq!(
            parse_filter("modes_list_string=kz_timer"),
            Some(("modes_list_string".into(), "kz_timer".into()))
        );
        assert_eq!(parse_filter("novalue"), None);
        assert_eq!(parse_filter("=x"), None);
    }
}
