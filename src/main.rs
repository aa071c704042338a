use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use kz_ingest::api::{HttpTransport, ProxyPool, Sleeper, TokioSleeper, Transport};
use kz_ingest::config::{parse_streams, IngestConfig};
use kz_ingest::database_ops::{CheckpointBackend, CheckpointStore, LeaderboardStore, PgLeaderboardStore};
use kz_ingest::ingest::{run_all, IngestionController, PipelineDeps, PipelineState};
use kz_ingest::shutdown::ShutdownCoordinator;
use kz_ingest::util::db::Db;
use kz_ingest::util::env as env_util;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kz-ingest", version, about = "Resumable KZ leaderboard ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    // `kz-ingest --stream bans` works without the explicit `run` subcommand.
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest one or more streams (default when no command supplied)
    Run(RunArgs),
    /// Print stored checkpoints
    Status(StoreArgs),
    /// Delete stored checkpoints so the next run starts over
    Reset {
        /// Stream names (comma-separated) or `all`
        streams: String,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Apply pending migrations and exit
    Migrate,
}

#[derive(Debug, Default, Args)]
struct StoreArgs {
    /// Keep checkpoints as JSON files in this directory instead of the database
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Streams to ingest (comma-separated) or `all`; falls back to INGEST_STREAMS
    #[arg(long)]
    stream: Option<String>,
    /// Ids per window or rows per page
    #[arg(long)]
    batch_size: Option<usize>,
    /// Pause between batches in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,
    /// Start cursor, overriding any stored checkpoint
    #[arg(long)]
    start: Option<i64>,
    /// Stop before this cursor
    #[arg(long)]
    end: Option<i64>,
    /// Fetch and normalize only; nothing is written
    #[arg(long, action = ArgAction::SetTrue)]
    dry_run: bool,
    /// Ignore stored checkpoints and overwrite existing records
    #[arg(long, action = ArgAction::SetTrue)]
    force_refresh: bool,
    #[command(flatten)]
    store: StoreArgs,
    /// Apply pending migrations before ingesting
    #[arg(long, action = ArgAction::SetTrue)]
    migrate: bool,
    /// API base url
    #[arg(long)]
    api_base: Option<String>,
}

impl RunArgs {
    fn apply(self, cfg: &mut IngestConfig) -> Result<()> {
        if let Some(raw) = self.stream {
            cfg.streams = parse_streams(&raw)?;
        }
        if let Some(n) = self.batch_size {
            cfg.batch_size = n.max(1);
        }
        if let Some(ms) = self.delay_ms {
            cfg.batch_delay = Duration::from_millis(ms);
        }
        if self.start.is_some() {
            cfg.start = self.start;
        }
        if self.end.is_some() {
            cfg.end = self.end;
        }
        cfg.dry_run |= self.dry_run;
        cfg.force_refresh |= self.force_refresh;
        cfg.auto_migrate |= self.migrate;
        if let Some(dir) = self.store.checkpoint_dir {
            cfg.checkpoint_dir = Some(dir);
        }
        if let Some(base) = self.api_base {
            cfg.api_base = base;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    kz_ingest::tracing::init_tracing(kz_ingest::tracing::DEFAULT_FILTER)?;

    let cli = Cli::parse();
    let mut cfg = IngestConfig::from_env()?;
    match cli.command {
        None => {
            cli.run.apply(&mut cfg)?;
            run(cfg).await
        }
        Some(Command::Run(args)) => {
            args.apply(&mut cfg)?;
            run(cfg).await
        }
        Some(Command::Status(args)) => {
            let (_, checkpoints) = open_storage(&cfg, args.checkpoint_dir).await?;
            status(&checkpoints).await
        }
        Some(Command::Reset { streams, store }) => {
            let kinds = parse_streams(&streams)?;
            let (_, checkpoints) = open_storage(&cfg, store.checkpoint_dir).await?;
            for kind in kinds {
                let removed = checkpoints.reset(kind.as_str()).await?;
                info!(stream = %kind, removed, "checkpoint reset");
            }
            Ok(())
        }
        Some(Command::Migrate) => {
            let db = Db::connect(&env_util::db_url()?, 1).await?;
            db.migrate().await?;
            Ok(())
        }
    }
}

async fn open_storage(
    cfg: &IngestConfig,
    checkpoint_dir: Option<PathBuf>,
) -> Result<(Arc<dyn LeaderboardStore>, Arc<CheckpointStore>)> {
    let db = Db::connect(&env_util::db_url()?, cfg.db_max_conns)
        .await
        .context("connect to database")?;
    if cfg.auto_migrate {
        db.migrate().await.context("apply migrations")?;
    }
    let store: Arc<dyn LeaderboardStore> = Arc::new(PgLeaderboardStore::new(&db));
    let backend = match checkpoint_dir.or_else(|| cfg.checkpoint_dir.clone()) {
        Some(dir) => CheckpointBackend::Directory(dir),
        None => CheckpointBackend::Table,
    };
    let checkpoints = Arc::new(CheckpointStore::new(backend, store.clone()));
    info!(backend = ?checkpoints.backend(), "checkpoint storage ready");
    Ok((store, checkpoints))
}

async fn status(checkpoints: &CheckpointStore) -> Result<()> {
    let states = checkpoints.list().await?;
    if states.is_empty() {
        println!("no checkpoints stored");
    }
    for s in states {
        println!(
            "{:<8} cursor={:<10} processed={} inserted={} updated={} skipped={} errors={} updated_at={}",
            s.stream,
            s.cursor,
            s.processed,
            s.inserted,
            s.updated,
            s.skipped,
            s.errors,
            s.updated_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn run(cfg: IngestConfig) -> Result<()> {
    env_util::preflight_log(
        "kz-ingest",
        &[
            "DATABASE_URL",
            "KZ_API_BASE",
            "KZ_PROXIES",
            "INGEST_STREAMS",
            "INGEST_BATCH_SIZE",
            "INGEST_CHECKPOINT_DIR",
        ],
    );
    let (store, checkpoints) = open_storage(&cfg, None).await?;

    let pool = Arc::new(ProxyPool::new(&cfg.proxies));
    if pool.is_empty() {
        info!("no proxies configured; using the direct route only");
    }
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
        &cfg.api_base,
        pool.routes(),
        cfg.retry.timeout,
    )?);
    let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);
    let shutdown = ShutdownCoordinator::shared();
    shutdown.install_signal_handler();

    let deps = PipelineDeps {
        transport,
        pool: pool.clone(),
        store,
        checkpoints,
        sleeper,
        shutdown,
    };
    info!(
        streams = ?cfg.streams.iter().map(|k| k.as_str()).collect::<Vec<_>>(),
        routes = pool.len(),
        api = %cfg.api_base,
        "ingestion starting"
    );
    let controllers: Vec<IngestionController> = cfg
        .streams
        .iter()
        .map(|kind| IngestionController::from_config(*kind, &cfg, &deps))
        .collect();

    let mut failed = 0usize;
    for result in run_all(controllers).await {
        match result {
            Ok(summary) => {
                if summary.final_state == PipelineState::Stopping {
                    warn!(stream = %summary.stream, cursor = summary.cursor, "stopped before completion");
                }
                match serde_json::to_string(&summary) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!(error = %e, "summary not serializable"),
                }
            }
            Err(e) => {
                failed += 1;
                error!(error = %format!("{e:#}"), "stream failed");
            }
        }
    }
    info!(forced_rotations = pool.forced_rotations(), "ingestion finished");
    if failed > 0 {
        anyhow::bail!("{failed} stream(s) failed");
    }
    Ok(())
}
