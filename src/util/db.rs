use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgSslMode},
    PgPool, Row,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans (they may contain credentials).
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options = PgConnectOptions::from_str(database_url)
            .context("invalid database URL")?;

        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }

        // Optional fast-ingest session tuning
        let fast_ingest = crate::util::env::env_flag("FAST_INGEST", false);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if fast_ingest {
                        // Best-effort; restricted roles may refuse the SET.
                        let _ = sqlx::query("SET synchronous_commit = 'off'")
                            .execute(&mut *conn)
                            .await;
                    }
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await?;
        info!(max_connections, fast_ingest, "connected to db");
        Ok(Self { pool })
    }

    /// Apply `migrations/NNNN_name.sql` files that are not yet recorded.
    pub async fn migrate(&self) -> Result<usize> {
        let dir = std::env::var("MIGRATIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"));
        run_migrations(&self.pool, &dir).await
    }
}

// Custom lightweight migration runner that ignores non-numeric filenames.
async fn run_migrations(pool: &PgPool, dir: &Path) -> Result<usize> {
    if !dir.exists() {
        info!(dir = %dir.display(), "no migrations directory; skipping");
        return Ok(0);
    }
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS _ingest_migrations (
            version BIGINT PRIMARY KEY,
            description TEXT,
            installed_at TIMESTAMPTZ DEFAULT now()
         )",
    )
    .execute(pool)
    .await?;

    let applied_rows = sqlx::raw_sql("SELECT version FROM _ingest_migrations")
        .fetch_all(pool)
        .await?;
    let mut applied: HashSet<i64> = HashSet::new();
    for r in applied_rows {
        applied.insert(r.try_get::<i64, _>(0)?);
    }

    let mut candidates = migration_candidates(dir)?;
    candidates.sort_by_key(|(v, _, _)| *v);

    let mut ran = 0usize;
    for (version, desc, path) in candidates {
        if applied.contains(&version) {
            continue;
        }
        let sql = std::fs::read_to_string(&path)
            .with_context(|| format!("reading migration {}", path.display()))?;
        info!(version, file = ?path, "applying migration");
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(&sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO _ingest_migrations(version, description) VALUES ($1, $2)")
            .bind(version)
            .bind(&desc)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        applied.insert(version);
        ran += 1;
    }
    info!(ran, "migrations up-to-date");
    Ok(ran)
}

fn migration_candidates(dir: &Path) -> Result<Vec<(i64, String, PathBuf)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(fname) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some((version, desc)) = parse_migration_name(fname) {
            out.push((version, desc, path.clone()));
        }
    }
    Ok(out)
}

/// pattern: digits '_' rest '.sql'
fn parse_migration_name(fname: &str) -> Option<(i64, String)> {
    let stem = fname.strip_suffix(".sql")?;
    let (num, rest) = stem.split_once('_')?;
    if num.is_empty() || !num.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((num.parse().ok()?, rest.to_string()))
}
