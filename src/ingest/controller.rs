//! The per-stream ingestion loop.
//!
//! ```text
//! Idle → Fetching → Normalizing → Resolving → Writing → Checkpointing → Sleeping → Fetching …
//!          │
//!          └→ Done (source exhausted / final cursor)        any state → Stopping
//! ```
//!
//! The checkpoint only moves after the batch it covers has been written, so
//! a crash at any point re-fetches at most one already-idempotent window.

use crate::api::fetcher::{exponential_backoff, FetchOutcome, RateLimitedFetcher};
use crate::api::models::ExternalRecord;
use crate::api::proxy_pool::ProxyPool;
use crate::api::sleeper::Sleeper;
use crate::api::transport::{FetchRequest, Transport};
use crate::config::IngestConfig;
use crate::database_ops::checkpoint::CheckpointStore;
use crate::database_ops::resolver::EntityResolver;
use crate::database_ops::rows::CheckpointState;
use crate::database_ops::store::LeaderboardStore;
use crate::database_ops::writer::{describe_ids, BatchWriter, WriteStats};
use crate::ingest::stream::{StreamKind, Window};
use crate::metrics::{CounterSnapshot, IngestCounters};
use crate::normalization::{BatchNormalizer, NormalizedRow};
use crate::shutdown::SharedShutdown;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CHECKPOINT_ATTEMPTS: u32 = 3;
/// Window passes that may restart at the same failed id before it is skipped.
const FAILED_ID_PASSES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Fetching,
    Normalizing,
    Resolving,
    Writing,
    Checkpointing,
    Sleeping,
    Stopping,
    Done,
}

/// Loop tunables, usually taken from [`IngestConfig`].
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub dry_run: bool,
    pub force_refresh: bool,
    pub filters: Vec<(String, String)>,
    pub batch_backoff: Duration,
    pub max_backoff: Duration,
    pub summary_interval: Duration,
}

impl From<&IngestConfig> for ControllerOptions {
    fn from(cfg: &IngestConfig) -> Self {
        Self {
            batch_size: cfg.batch_size,
            batch_delay: cfg.batch_delay,
            start: cfg.start,
            end: cfg.end,
            dry_run: cfg.dry_run,
            force_refresh: cfg.force_refresh,
            filters: cfg.filters.clone(),
            batch_backoff: cfg.batch_backoff,
            max_backoff: cfg.max_backoff,
            summary_interval: cfg.summary_interval,
        }
    }
}

/// Collaborators shared by every stream of one process.
#[derive(Clone)]
pub struct PipelineDeps {
    pub transport: Arc<dyn Transport>,
    pub pool: Arc<ProxyPool>,
    pub store: Arc<dyn LeaderboardStore>,
    pub checkpoints: Arc<CheckpointStore>,
    pub sleeper: Arc<dyn Sleeper>,
    pub shutdown: SharedShutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub stream: StreamKind,
    pub final_state: PipelineState,
    pub cursor: i64,
    pub counters: CounterSnapshot,
    pub elapsed_secs: f64,
}

enum WindowFetch {
    Data {
        elements: Vec<ExternalRecord>,
        next_cursor: i64,
        exhausted: bool,
        failures: u64,
        /// Lowest id that failed after retries while others in the window succeeded.
        first_failed: Option<i64>,
    },
    Exhausted,
    Retry(String),
}

pub struct IngestionController {
    kind: StreamKind,
    opts: ControllerOptions,
    fetcher: RateLimitedFetcher,
    checkpoints: Arc<CheckpointStore>,
    resolver: EntityResolver,
    writer: BatchWriter,
    normalizer: BatchNormalizer,
    sleeper: Arc<dyn Sleeper>,
    shutdown: SharedShutdown,
    counters: Arc<IngestCounters>,
    state: PipelineState,
    /// Failed id the cursor is parked on, and how many passes hit it.
    parked: Option<(i64, u32)>,
}

impl IngestionController {
    pub fn new(
        kind: StreamKind,
        opts: ControllerOptions,
        deps: &PipelineDeps,
        fetcher: RateLimitedFetcher,
        counters: Arc<IngestCounters>,
    ) -> Self {
        Self {
            kind,
            writer: BatchWriter::new(deps.store.clone(), opts.force_refresh),
            resolver: EntityResolver::new(deps.store.clone()),
            opts,
            fetcher,
            checkpoints: deps.checkpoints.clone(),
            normalizer: BatchNormalizer::new(),
            sleeper: deps.sleeper.clone(),
            shutdown: deps.shutdown.clone(),
            counters,
            state: PipelineState::Idle,
            parked: None,
        }
    }

    /// One controller per stream with its own counters, fetcher and entity cache.
    pub fn from_config(kind: StreamKind, cfg: &IngestConfig, deps: &PipelineDeps) -> Self {
        let counters = Arc::new(IngestCounters::new());
        let fetcher = RateLimitedFetcher::new(
            deps.transport.clone(),
            deps.pool.clone(),
            cfg.retry.clone(),
            deps.sleeper.clone(),
            counters.clone(),
        );
        Self::new(kind, ControllerOptions::from(cfg), deps, fetcher, counters)
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn counters(&self) -> Arc<IngestCounters> {
        self.counters.clone()
    }

    fn transition(&mut self, next: PipelineState) {
        if self.state != next {
            debug!(stream = %self.kind, from = ?self.state, to = ?next, "state");
            self.state = next;
        }
    }

    /// Sleep unless shutdown is requested first. False when interrupted.
    async fn pause(&self, duration: Duration) -> bool {
        if self.shutdown.is_shutdown_requested() {
            return false;
        }
        tokio::select! {
            _ = self.sleeper.sleep(duration) => !self.shutdown.is_shutdown_requested(),
            _ = self.shutdown.wait_for_shutdown() => false,
        }
    }

    /// Run until the source is exhausted, the final cursor is reached, or a
    /// stop is requested. `Err` only for fatal checkpoint storage failures.
    /// The final summary is logged either way.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let result = self.drive(started).await;
        let counters = self.counters.snapshot();
        let elapsed = started.elapsed();
        match &result {
            Ok(_) => counters.log("final summary", self.kind.as_str(), elapsed),
            Err(_) => counters.log("final summary (aborted)", self.kind.as_str(), elapsed),
        }
        let (final_state, cursor) = result?;
        Ok(RunSummary {
            stream: self.kind,
            final_state,
            cursor,
            counters,
            elapsed_secs: elapsed.as_secs_f64(),
        })
    }

    async fn drive(&mut self, started: Instant) -> Result<(PipelineState, i64)> {
        let mut last_summary = Instant::now();
        let mut checkpoint = self.initial_checkpoint().await?;
        let mut fetch_failures: u32 = 0;
        info!(
            stream = %self.kind,
            cursor = checkpoint.cursor,
            end = ?self.opts.end,
            batch_size = self.opts.batch_size,
            routes = self.fetcher.pool().len(),
            dry_run = self.opts.dry_run,
            force_refresh = self.opts.force_refresh,
            "stream starting"
        );

        let outcome = loop {
            if self.shutdown.is_shutdown_requested() {
                break PipelineState::Stopping;
            }
            if last_summary.elapsed() >= self.opts.summary_interval {
                self.counters
                    .snapshot()
                    .log("progress", self.kind.as_str(), started.elapsed());
                last_summary = Instant::now();
            }

            let Some(window) = Window::plan(
                self.kind,
                checkpoint.cursor,
                self.opts.batch_size,
                self.fetcher.pool().len(),
                self.opts.end,
            ) else {
                break PipelineState::Done;
            };

            self.transition(PipelineState::Fetching);
            let (elements, next_cursor, exhausted, failures) = match self.fetch_window(&window).await {
                WindowFetch::Exhausted => break PipelineState::Done,
                WindowFetch::Retry(reason) => {
                    fetch_failures += 1;
                    let wait = exponential_backoff(
                        self.opts.batch_backoff,
                        fetch_failures,
                        self.opts.max_backoff,
                    );
                    warn!(
                        stream = %self.kind,
                        cursor = checkpoint.cursor,
                        window_end = window.end_cursor(),
                        attempt = fetch_failures,
                        wait_ms = wait.as_millis() as u64,
                        %reason,
                        "window fetch failed; retrying same window"
                    );
                    self.transition(PipelineState::Sleeping);
                    self.pause(wait).await;
                    continue;
                }
                WindowFetch::Data {
                    elements,
                    next_cursor,
                    exhausted,
                    failures,
                    first_failed,
                } => {
                    let (next_cursor, failures) = self.settle_failed_ids(next_cursor, first_failed, failures);
                    (elements, next_cursor, exhausted, failures)
                }
            };
            fetch_failures = 0;

            self.transition(PipelineState::Normalizing);
            let batch = self.normalizer.normalize_batch(&elements);
            let fetched = elements.len() as u64;
            let rejected = batch.rejected.len() as u64;
            self.counters.add_processed(fetched);
            self.counters.add_rejected(rejected);
            self.counters.add_errors(failures);

            let stats = if self.opts.dry_run {
                info!(
                    stream = %self.kind,
                    cursor = checkpoint.cursor,
                    next_cursor,
                    rows = batch.rows.len(),
                    rejected,
                    "dry run; batch not written"
                );
                WriteStats::default()
            } else {
                match self.commit(batch.rows).await {
                    Some(stats) => stats,
                    None => break PipelineState::Stopping,
                }
            };
            self.counters.add_inserted(stats.inserted);
            self.counters.add_updated(stats.updated);
            self.counters.add_skipped(stats.skipped);
            self.counters.inc_batches();

            checkpoint.cursor = next_cursor;
            checkpoint.processed += fetched;
            checkpoint.inserted += stats.inserted;
            checkpoint.updated += stats.updated;
            checkpoint.skipped += stats.skipped;
            checkpoint.errors += failures + rejected;
            if !self.opts.dry_run {
                self.transition(PipelineState::Checkpointing);
                self.save_checkpoint(&mut checkpoint).await?;
            }
            debug!(
                stream = %self.kind,
                cursor = next_cursor,
                fetched,
                inserted = stats.inserted,
                updated = stats.updated,
                skipped = stats.skipped,
                rejected,
                failures,
                "batch committed"
            );

            if exhausted {
                break PipelineState::Done;
            }
            self.transition(PipelineState::Sleeping);
            self.pause(self.opts.batch_delay).await;
        };

        self.transition(outcome);
        if !self.opts.dry_run {
            // Nothing past the last committed batch is in `checkpoint`.
            self.transition(PipelineState::Checkpointing);
            self.save_checkpoint(&mut checkpoint).await?;
            self.transition(outcome);
        }
        Ok((outcome, checkpoint.cursor))
    }

    /// Where the cursor goes after a window in which some ids failed. It parks
    /// on the lowest failed id so the next window retries it; after
    /// `FAILED_ID_PASSES` passes on the same id the window is skipped and its
    /// failures are counted as errors.
    fn settle_failed_ids(&mut self, window_end: i64, first_failed: Option<i64>, failures: u64) -> (i64, u64) {
        let Some(id) = first_failed else {
            self.parked = None;
            return (window_end, 0);
        };
        let passes = match self.parked {
            Some((parked, n)) if parked == id => n + 1,
            _ => 1,
        };
        if passes > FAILED_ID_PASSES {
            warn!(stream = %self.kind, id, failures, "ids still failing; skipping past window");
            self.parked = None;
            return (window_end, failures);
        }
        info!(stream = %self.kind, id, pass = passes, "ids failed; next window restarts at the first one");
        self.parked = Some((id, passes));
        (id, 0)
    }

    async fn initial_checkpoint(&self) -> Result<CheckpointState> {
        let mut state = if self.opts.force_refresh {
            CheckpointState::new(self.kind.as_str(), self.kind.initial_cursor())
        } else {
            self.checkpoints
                .load(self.kind)
                .await
                .with_context(|| format!("load checkpoint for {}", self.kind))?
        };
        if let Some(start) = self.opts.start {
            state.cursor = start;
        }
        Ok(state)
    }

    async fn save_checkpoint(&self, state: &mut CheckpointState) -> Result<()> {
        state.updated_at = Utc::now();
        let mut last_err = None;
        for attempt in 1..=CHECKPOINT_ATTEMPTS {
            match self.checkpoints.save(state).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(stream = %self.kind, attempt, error = %format!("{e:#}"), "checkpoint save failed");
                    last_err = Some(e);
                    if attempt < CHECKPOINT_ATTEMPTS {
                        self.sleeper
                            .sleep(exponential_backoff(self.opts.batch_backoff, attempt, self.opts.max_backoff))
                            .await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("checkpoint save failed")))
            .with_context(|| format!("checkpoint storage unavailable for {}", self.kind))
    }

    /// Resolve and write with batch-level retry. `None` when a stop request
    /// arrives while waiting to retry; the batch is then left uncommitted.
    async fn commit(&mut self, rows: Vec<NormalizedRow>) -> Option<WriteStats> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.transition(PipelineState::Resolving);
            let result = match self.writer.resolve(&mut self.resolver, rows.clone()).await {
                Ok(resolved) => {
                    self.transition(PipelineState::Writing);
                    self.writer.write(&resolved).await.map(|stats| {
                        debug!(stream = %self.kind, ids = %describe_ids(&resolved), "written");
                        stats
                    })
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(stats) => return Some(stats),
                Err(e) => {
                    let wait = exponential_backoff(self.opts.batch_backoff, attempt, self.opts.max_backoff);
                    if attempt >= 2 {
                        warn!(
                            stream = %self.kind,
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            error = %format!("{e:#}"),
                            "storage write keeps failing; still retrying"
                        );
                    } else {
                        info!(stream = %self.kind, error = %format!("{e:#}"), "storage write failed; retrying");
                    }
                    self.transition(PipelineState::Sleeping);
                    if !self.pause(wait).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn fetch_window(&self, window: &Window) -> WindowFetch {
        let pool = self.fetcher.pool();
        let concurrency = if pool.is_parallel() { pool.len() } else { 1 };
        match *window {
            Window::Ids { start, end } => self.fetch_ids(start, end, concurrency).await,
            Window::Pages {
                offset,
                limit,
                pages,
            } => self.fetch_pages(offset, limit, pages, concurrency).await,
        }
    }

    async fn fetch_ids(&self, start: i64, end: i64, concurrency: usize) -> WindowFetch {
        let kind = self.kind;
        let fetcher = &self.fetcher;
        let filters = &self.opts.filters;
        let results: Vec<(i64, Result<serde_json::Value, FetchOutcome>)> = stream::iter(start..end)
            .map(|id| async move {
                let req = FetchRequest::by_id(kind, id).with_filters(filters);
                (id, fetcher.fetch(&req).await)
            })
            .buffered(concurrency)
            .collect()
            .await;

        let mut elements = Vec::new();
        let mut successes = 0usize;
        let mut failed: Vec<(i64, FetchOutcome)> = Vec::new();
        for (id, result) in results {
            match result {
                Ok(payload) => {
                    successes += 1;
                    elements.extend(ExternalRecord::from_payload(kind, payload));
                }
                Err(FetchOutcome::NotFound) => {}
                Err(outcome) => failed.push((id, outcome)),
            }
        }

        if successes == 0 {
            return match failed.first() {
                Some((id, outcome)) => WindowFetch::Retry(format!("id {id}: {outcome}")),
                None => WindowFetch::Exhausted,
            };
        }
        if !failed.is_empty() {
            let ids: Vec<i64> = failed.iter().map(|(id, _)| *id).collect();
            warn!(stream = %kind, ?ids, "ids failed after retries");
        }
        WindowFetch::Data {
            elements,
            next_cursor: end,
            exhausted: false,
            failures: failed.len() as u64,
            first_failed: failed.iter().map(|(id, _)| *id).min(),
        }
    }

    async fn fetch_pages(&self, offset: i64, limit: i64, pages: usize, concurrency: usize) -> WindowFetch {
        let kind = self.kind;
        let fetcher = &self.fetcher;
        let filters = &self.opts.filters;
        let results: Vec<(i64, Result<serde_json::Value, FetchOutcome>)> = stream::iter(0..pages as i64)
            .map(|i| {
                let page_offset = offset + i * limit;
                async move {
                    let req = FetchRequest::page(kind, page_offset, limit).with_filters(filters);
                    (page_offset, fetcher.fetch(&req).await)
                }
            })
            .buffered(concurrency)
            .collect()
            .await;

        let mut elements = Vec::new();
        let mut next_cursor = offset;
        let mut exhausted = false;
        let mut error = None;
        // Only the prefix of successful pages is committed.
        for (page_offset, result) in results {
            match result {
                Ok(payload) => {
                    let items = ExternalRecord::from_payload(kind, payload);
                    let n = items.len() as i64;
                    elements.extend(items);
                    next_cursor = page_offset + n;
                    if n < limit {
                        exhausted = true;
                        break;
                    }
                }
                Err(FetchOutcome::NotFound) => {
                    exhausted = true;
                    break;
                }
                Err(outcome) => {
                    error = Some(format!("offset {page_offset}: {outcome}"));
                    break;
                }
            }
        }

        if elements.is_empty() {
            if let Some(reason) = error {
                return WindowFetch::Retry(reason);
            }
            if exhausted {
                return WindowFetch::Exhausted;
            }
        }
        WindowFetch::Data {
            elements,
            next_cursor,
            exhausted,
            failures: 0,
            first_failed: None,
        }
    }
}

/// Run every controller concurrently; they share storage and the shutdown flag.
pub async fn run_all(controllers: Vec<IngestionController>) -> Vec<Result<RunSummary>> {
    let runs = controllers.into_iter().map(|mut c| async move {
        let kind = c.kind();
        c.run().await.with_context(|| format!("stream {kind}"))
    });
    futures::future::join_all(runs).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fetcher::tests::ScriptedTransport;
    use crate::api::fetcher::RetryPolicy;
    use crate::api::proxy_pool::Route;
    use crate::api::sleeper::RecordingSleeper;
    use crate::api::transport::{FetchTarget, TransportError, TransportResponse};
    use crate::database_ops::checkpoint::CheckpointBackend;
    use crate::database_ops::memory::MemoryStore;
    use crate::shutdown::ShutdownCoordinator;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    /// Serves `total` bans from a paged endpoint.
    struct PagedBans {
        total: i64,
    }

    #[async_trait]
    impl Transport for PagedBans {
        async fn get(&self, _route: &Route, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
            let FetchTarget::Page { offset, limit } = request.target else {
                return Ok(TransportResponse::NotFound);
            };
            let items: Vec<Value> = (offset..(offset + limit).min(self.total))
                .map(|i| json!({"id": i + 1, "ban_type": "strafe_hack", "steamid64": "76561198000000001"}))
                .collect();
            Ok(TransportResponse::Ok(Value::Array(items)))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(5),
            max_attempts: 2,
            backoff_base: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            cooldown: Duration::from_millis(50),
            success_delay_single: Duration::ZERO,
            success_delay_multi: Duration::ZERO,
        }
    }

    fn options(batch_size: usize) -> ControllerOptions {
        ControllerOptions {
            batch_size,
            batch_delay: Duration::from_millis(5),
            start: None,
            end: None,
            dry_run: false,
            force_refresh: false,
            filters: Vec::new(),
            batch_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            summary_interval: Duration::from_secs(3600),
        }
    }

    fn controller(
        kind: StreamKind,
        transport: Arc<dyn Transport>,
        store: Arc<MemoryStore>,
        opts: ControllerOptions,
        shutdown: SharedShutdown,
    ) -> IngestionController {
        controller_with_pool(kind, ProxyPool::direct(), transport, store, opts, shutdown)
    }

    fn controller_with_pool(
        kind: StreamKind,
        pool: ProxyPool,
        transport: Arc<dyn Transport>,
        store: Arc<MemoryStore>,
        opts: ControllerOptions,
        shutdown: SharedShutdown,
    ) -> IngestionController {
        let sleeper: Arc<dyn Sleeper> = Arc::new(RecordingSleeper::new());
        let deps = PipelineDeps {
            transport,
            pool: Arc::new(pool),
            store: store.clone(),
            checkpoints: Arc::new(CheckpointStore::new(CheckpointBackend::Table, store)),
            sleeper,
            shutdown,
        };
        let counters = Arc::new(IngestCounters::new());
        let fetcher = RateLimitedFetcher::new(
            deps.transport.clone(),
            deps.pool.clone(),
            policy(),
            deps.sleeper.clone(),
            counters.clone(),
        );
        IngestionController::new(kind, opts, &deps, fetcher, counters)
    }

    #[tokio::test]
    async fn paged_stream_stops_after_short_page() {
        let store = Arc::new(MemoryStore::new());
        let mut c = controller(
            StreamKind::Bans,
            Arc::new(PagedBans { total: 25 }),
            store.clone(),
            options(10),
            ShutdownCoordinator::shared(),
        );
        let summary = c.run().await.unwrap();
        assert_eq!(summary.final_state, PipelineState::Done);
        assert_eq!(summary.cursor, 25);
        assert_eq!(summary.counters.processed, 25);
        assert_eq!(summary.counters.inserted, 25);
        assert_eq!(store.lock().bans.len(), 25);
        let cp = store.lock().checkpoints["bans"].clone();
        assert_eq!(cp.cursor, 25);
    }

    #[tokio::test]
    async fn window_with_only_failures_is_retried_without_advancing() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            Ok(TransportResponse::Ok(json!({"id": 1, "map_name": "kz_a", "time": 5.0}))),
        ]));
        let mut opts = options(1);
        opts.end = Some(2);
        let mut c = controller(StreamKind::Records, transport, store.clone(), opts, ShutdownCoordinator::shared());
        let summary = c.run().await.unwrap();
        assert_eq!(summary.final_state, PipelineState::Done);
        assert_eq!(summary.cursor, 2);
        assert_eq!(store.record_count(), 1);
        assert_eq!(summary.counters.transient_errors, 2);
    }

    fn rec(id: i64) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::Ok(json!({"id": id, "map_name": "kz_a", "time": 5.0})))
    }

    #[tokio::test]
    async fn partial_window_restarts_at_the_failed_id() {
        let store = Arc::new(MemoryStore::new());
        // Window [1, 3]: id 2 fails twice. Next window [2, 3] succeeds.
        let transport = Arc::new(ScriptedTransport::new(vec![
            rec(1),
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            rec(3),
            rec(2),
            rec(3),
        ]));
        let mut opts = options(3);
        opts.end = Some(4);
        let mut c = controller(StreamKind::Records, transport, store.clone(), opts, ShutdownCoordinator::shared());
        let summary = c.run().await.unwrap();
        assert_eq!(summary.final_state, PipelineState::Done);
        assert_eq!(summary.cursor, 4);
        assert_eq!(store.record_count(), 3);
        assert_eq!(summary.counters.errors, 0);
        assert_eq!(store.lock().checkpoints["records"].errors, 0);
    }

    #[tokio::test]
    async fn id_that_keeps_failing_is_skipped_after_bounded_passes() {
        let store = Arc::new(MemoryStore::new());
        let mut script = vec![rec(1)];
        for _ in 0..=FAILED_ID_PASSES {
            script.extend([Err(TransportError::Timeout), Err(TransportError::Timeout), rec(3)]);
        }
        let transport = Arc::new(ScriptedTransport::new(script));
        let mut opts = options(3);
        opts.end = Some(4);
        let mut c = controller(StreamKind::Records, transport, store.clone(), opts, ShutdownCoordinator::shared());
        let summary = c.run().await.unwrap();
        assert_eq!(summary.final_state, PipelineState::Done);
        assert_eq!(summary.cursor, 4);
        assert_eq!(store.record_count(), 2);
        assert_eq!(summary.counters.errors, 1);
        assert_eq!(store.lock().checkpoints["records"].errors, 1);
    }

    #[tokio::test]
    async fn window_fans_out_over_every_proxy() {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new((1..=6).map(rec).collect()));
        let pool = ProxyPool::new(["http://a:1", "http://b:2", "http://c:3"]);
        let mut opts = options(6);
        opts.end = Some(7);
        let mut c = controller_with_pool(
            StreamKind::Records,
            pool,
            transport.clone(),
            store.clone(),
            opts,
            ShutdownCoordinator::shared(),
        );
        let summary = c.run().await.unwrap();
        assert_eq!(summary.final_state, PipelineState::Done);
        assert_eq!(summary.cursor, 7);
        assert_eq!(store.record_count(), 6);

        let seen: Vec<String> = transport
            .seen_routes
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.label().to_string())
            .collect();
        assert_eq!(seen.len(), 6);
        for proxy in ["http://a:1", "http://b:2", "http://c:3"] {
            assert_eq!(seen.iter().filter(|s| *s == proxy).count(), 2, "{seen:?}");
        }
    }

    #[tokio::test]
    async fn storage_failures_are_retried_then_committed() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_writes(2);
        let mut opts = options(10);
        opts.end = Some(10);
        let mut c = controller(
            StreamKind::Bans,
            Arc::new(PagedBans { total: 3 }),
            store.clone(),
            opts,
            ShutdownCoordinator::shared(),
        );
        let summary = c.run().await.unwrap();
        assert_eq!(summary.final_state, PipelineState::Done);
        assert_eq!(store.lock().bans.len(), 3);
        assert_eq!(store.lock().checkpoints["bans"].cursor, 3);
    }

    #[tokio::test]
    async fn checkpoint_storage_outage_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_checkpoints(CHECKPOINT_ATTEMPTS);
        let mut c = controller(
            StreamKind::Bans,
            Arc::new(PagedBans { total: 3 }),
            store.clone(),
            options(10),
            ShutdownCoordinator::shared(),
        );
        assert!(c.run().await.is_err());
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let mut opts = options(10);
        opts.dry_run = true;
        let mut c = controller(
            StreamKind::Bans,
            Arc::new(PagedBans { total: 15 }),
            store.clone(),
            opts,
            ShutdownCoordinator::shared(),
        );
        let summary = c.run().await.unwrap();
        assert_eq!(summary.counters.processed, 15);
        assert_eq!(summary.cursor, 15);
        assert!(store.lock().bans.is_empty());
        assert!(store.lock().checkpoints.is_empty());
    }

    #[tokio::test]
    async fn stop_request_saves_checkpoint_and_exits() {
        let store = Arc::new(MemoryStore::new());
        let shutdown = ShutdownCoordinator::shared();
        shutdown.request_shutdown();
        let mut c = controller(
            StreamKind::Bans,
            Arc::new(PagedBans { total: 100 }),
            store.clone(),
            options(10),
            shutdown,
        );
        let summary = c.run().await.unwrap();
        assert_eq!(summary.final_state, PipelineState::Stopping);
        assert_eq!(summary.cursor, 0);
        assert_eq!(store.lock().checkpoints["bans"].cursor, 0);
        assert!(store.lock().bans.is_empty());
    }
}
