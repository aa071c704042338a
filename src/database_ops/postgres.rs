use crate::database_ops::rows::{
    BanRow, CheckpointState, MapRow, PersonalBestRow, PlayerRow, RecordRow, ServerRow,
    WorldRecordRow,
};
use crate::database_ops::store::LeaderboardStore;
use crate::normalization::MapKey;
use crate::util::db::Db;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::instrument;

/// Rows per statement; keeps the widest row well under the bind limit.
const CHUNK_ROWS: usize = 2000;

/// Closes a `WITH w AS (INSERT ...` statement and folds the returned rows into
/// the affected-row convention (1 inserted, 2 updated).
const AFFECTED_TAIL: &str = " RETURNING (xmax = 0) AS inserted) \
     SELECT COALESCE(SUM(CASE WHEN inserted THEN 1 ELSE 2 END), 0)::BIGINT FROM w";

/// Condition under which an incoming variant time beats the stored one.
fn improves(table: &str, col: &str) -> String {
    format!("(EXCLUDED.{col} IS NOT NULL AND ({table}.{col} IS NULL OR EXCLUDED.{col} < {table}.{col}))")
}

/// `col = CASE WHEN <time improves> THEN EXCLUDED.col ELSE table.col END` for each col.
fn take_if_better(table: &str, time_col: &str, cols: &[&str]) -> String {
    let cond = improves(table, time_col);
    cols.iter()
        .map(|c| format!("{c} = CASE WHEN {cond} THEN EXCLUDED.{c} ELSE {table}.{c} END"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone)]
pub struct PgLeaderboardStore {
    pool: PgPool,
}

impl PgLeaderboardStore {
    pub fn new(db: &Db) -> Self {
        Self {
            pool: db.pool.clone(),
        }
    }

    async fn affected(&self, mut qb: QueryBuilder<'_, Postgres>) -> Result<u64> {
        let n: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(n.max(0) as u64)
    }
}

#[async_trait]
impl LeaderboardStore for PgLeaderboardStore {
    async fn insert_players_ignore(&self, rows: &[PlayerRow]) -> Result<u64> {
        let mut total = 0;
        for chunk in rows.chunks(CHUNK_ROWS) {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new("WITH w AS (INSERT INTO players (steamid64, steam_id, name, is_banned) ");
            qb.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.steamid64)
                    .push_bind(row.steam_id.clone())
                    .push_bind(row.name.clone())
                    .push_bind(row.is_banned.unwrap_or(false));
            });
            qb.push(" ON CONFLICT (steamid64) DO NOTHING");
            qb.push(AFFECTED_TAIL);
            total += self.affected(qb).await.context("insert players")?;
        }
        Ok(total)
    }

    async fn select_player_ids(&self, steamids: &[i64]) -> Result<HashMap<i64, i64>> {
        if steamids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(i64, i64)> =
            sqlx::query_as("SELECT steamid64, id FROM players WHERE steamid64 = ANY($1)")
                .bind(steamids.to_vec())
                .fetch_all(&self.pool)
                .await
                .context("select players")?;
        Ok(rows.into_iter().collect())
    }

    async fn insert_maps_ignore(&self, keys: &[MapKey]) -> Result<u64> {
        let mut total = 0;
        for chunk in keys.chunks(CHUNK_ROWS) {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new("WITH w AS (INSERT INTO maps (map_id, name) ");
            qb.push_values(chunk.iter(), |mut b, key| {
                b.push_bind(key.map_id).push_bind(key.name.clone());
            });
            qb.push(" ON CONFLICT (map_id, name) DO NOTHING");
            qb.push(AFFECTED_TAIL);
            total += self.affected(qb).await.context("insert maps")?;
        }
        Ok(total)
    }

    async fn select_map_ids(&self, keys: &[MapKey]) -> Result<HashMap<MapKey, i64>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<i32> = keys.iter().map(|k| k.map_id).collect();
        let names: Vec<String> = keys.iter().map(|k| k.name.clone()).collect();
        let rows: Vec<(i32, String, i64)> = sqlx::query_as(
            "SELECT m.map_id, m.name, m.id FROM maps m \
             JOIN UNNEST($1::int4[], $2::text[]) AS k(map_id, name) \
               ON m.map_id = k.map_id AND m.name = k.name",
        )
        .bind(ids)
        .bind(names)
        .fetch_all(&self.pool)
        .await
        .context("select maps")?;
        Ok(rows
            .into_iter()
            .map(|(map_id, name, id)| (MapKey { map_id, name }, id))
            .collect())
    }

    async fn insert_servers_ignore(&self, rows: &[ServerRow]) -> Result<u64> {
        let mut total = 0;
        for chunk in rows.chunks(CHUNK_ROWS) {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new("WITH w AS (INSERT INTO servers (server_id, name, ip, port, owner_steamid64) ");
            qb.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.server_id)
                    .push_bind(row.name.clone())
                    .push_bind(row.ip.clone())
                    .push_bind(row.port)
                    .push_bind(row.owner_steamid64);
            });
            qb.push(" ON CONFLICT (server_id) DO NOTHING");
            qb.push(AFFECTED_TAIL);
            total += self.affected(qb).await.context("insert servers")?;
        }
        Ok(total)
    }

    async fn select_server_ids(&self, server_ids: &[i32]) -> Result<HashMap<i32, i64>> {
        if server_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(i32, i64)> =
            sqlx::query_as("SELECT server_id, id FROM servers WHERE server_id = ANY($1)")
                .bind(server_ids.to_vec())
                .fetch_all(&self.pool)
                .await
                .context("select servers")?;
        Ok(rows.into_iter().collect())
    }

    #[instrument(level = "debug", skip_all, fields(rows = rows.len()))]
    async fn insert_records(&self, rows: &[RecordRow], overwrite: bool) -> Result<u64> {
        let mut total = 0;
        for chunk in rows.chunks(CHUNK_ROWS) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "WITH w AS (INSERT INTO records (original_id, player_id, map_id, server_id, mode, stage, time, \
                 teleports, points, tickrate, record_filter_id, replay_id, created_on, updated_on) ",
            );
            qb.push_values(chunk.iter(), |mut b, r| {
                b.push_bind(r.original_id)
                    .push_bind(r.player_id)
                    .push_bind(r.map_id)
                    .push_bind(r.server_id)
                    .push_bind(r.mode.clone())
                    .push_bind(r.stage)
                    .push_bind(r.time)
                    .push_bind(r.teleports)
                    .push_bind(r.points)
                    .push_bind(r.tickrate)
                    .push_bind(r.record_filter_id)
                    .push_bind(r.replay_id)
                    .push_bind(r.created_on)
                    .push_bind(r.updated_on);
            });
            if overwrite {
                qb.push(
                    " ON CONFLICT (original_id) DO UPDATE SET player_id = EXCLUDED.player_id, \
                     map_id = EXCLUDED.map_id, server_id = EXCLUDED.server_id, mode = EXCLUDED.mode, \
                     stage = EXCLUDED.stage, time = EXCLUDED.time, teleports = EXCLUDED.teleports, \
                     points = EXCLUDED.points, tickrate = EXCLUDED.tickrate, \
                     record_filter_id = EXCLUDED.record_filter_id, replay_id = EXCLUDED.replay_id, \
                     created_on = EXCLUDED.created_on, updated_on = EXCLUDED.updated_on",
                );
            } else {
                qb.push(" ON CONFLICT (original_id) DO NOTHING");
            }
            qb.push(AFFECTED_TAIL);
            total += self.affected(qb).await.context("insert records")?;
        }
        Ok(total)
    }

    #[instrument(level = "debug", skip_all, fields(rows = rows.len()))]
    async fn merge_personal_bests(&self, rows: &[PersonalBestRow]) -> Result<u64> {
        let mut total = 0;
        for chunk in rows.chunks(CHUNK_ROWS) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "WITH w AS (INSERT INTO personal_bests AS pb (player_id, map_id, mode, stage, \
                 clean_time, clean_record_id, assisted_time, assisted_record_id) ",
            );
            qb.push_values(chunk.iter(), |mut b, r| {
                b.push_bind(r.player_id)
                    .push_bind(r.map_id)
                    .push_bind(r.mode.clone())
                    .push_bind(r.stage)
                    .push_bind(r.clean.map(|c| c.time))
                    .push_bind(r.clean.map(|c| c.record_id))
                    .push_bind(r.assisted.map(|a| a.time))
                    .push_bind(r.assisted.map(|a| a.record_id));
            });
            qb.push(" ON CONFLICT (player_id, map_id, mode, stage) DO UPDATE SET ");
            qb.push(take_if_better("pb", "clean_time", &["clean_record_id", "clean_time"]));
            qb.push(", ");
            qb.push(take_if_better("pb", "assisted_time", &["assisted_record_id", "assisted_time"]));
            qb.push(", updated_at = now() WHERE ");
            qb.push(improves("pb", "clean_time"));
            qb.push(" OR ");
            qb.push(improves("pb", "assisted_time"));
            qb.push(AFFECTED_TAIL);
            total += self.affected(qb).await.context("merge personal bests")?;
        }
        Ok(total)
    }

    #[instrument(level = "debug", skip_all, fields(rows = rows.len()))]
    async fn merge_world_records(&self, rows: &[WorldRecordRow]) -> Result<u64> {
        let mut total = 0;
        for chunk in rows.chunks(CHUNK_ROWS) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "WITH w AS (INSERT INTO world_records AS wr (map_id, mode, stage, clean_time, \
                 clean_record_id, clean_player_id, assisted_time, assisted_record_id, assisted_player_id) ",
            );
            qb.push_values(chunk.iter(), |mut b, r| {
                b.push_bind(r.map_id)
                    .push_bind(r.mode.clone())
                    .push_bind(r.stage)
                    .push_bind(r.clean.map(|c| c.time))
                    .push_bind(r.clean.map(|c| c.record_id))
                    .push_bind(r.clean.map(|c| c.player_id))
                    .push_bind(r.assisted.map(|a| a.time))
                    .push_bind(r.assisted.map(|a| a.record_id))
                    .push_bind(r.assisted.map(|a| a.player_id));
            });
            qb.push(" ON CONFLICT (map_id, mode, stage) DO UPDATE SET ");
            qb.push(take_if_better(
                "wr",
                "clean_time",
                &["clean_record_id", "clean_player_id", "clean_time"],
            ));
            qb.push(", ");
            qb.push(take_if_better(
                "wr",
                "assisted_time",
                &["assisted_record_id", "assisted_player_id", "assisted_time"],
            ));
            qb.push(", updated_at = now() WHERE ");
            qb.push(improves("wr", "clean_time"));
            qb.push(" OR ");
            qb.push(improves("wr", "assisted_time"));
            qb.push(AFFECTED_TAIL);
            total += self.affected(qb).await.context("merge world records")?;
        }
        Ok(total)
    }

    #[instrument(level = "debug", skip_all, fields(rows = rows.len()))]
    async fn upsert_bans(&self, rows: &[BanRow]) -> Result<u64> {
        let mut total = 0;
        for chunk in rows.chunks(CHUNK_ROWS) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "WITH w AS (INSERT INTO bans (ban_id, player_id, server_id, ban_type, expires_on, notes, stats, \
                 created_on, updated_on) ",
            );
            qb.push_values(chunk.iter(), |mut b, r| {
                b.push_bind(r.ban_id)
                    .push_bind(r.player_id)
                    .push_bind(r.server_id)
                    .push_bind(r.ban_type.clone())
                    .push_bind(r.expires_on)
                    .push_bind(r.notes.clone())
                    .push_bind(r.stats.clone())
                    .push_bind(r.created_on)
                    .push_bind(r.updated_on);
            });
            qb.push(
                " ON CONFLICT (ban_id) DO UPDATE SET player_id = EXCLUDED.player_id, \
                 server_id = EXCLUDED.server_id, ban_type = EXCLUDED.ban_type, \
                 expires_on = EXCLUDED.expires_on, notes = EXCLUDED.notes, stats = EXCLUDED.stats, \
                 created_on = EXCLUDED.created_on, updated_on = EXCLUDED.updated_on \
                 WHERE (bans.player_id, bans.server_id, bans.ban_type, bans.expires_on, bans.notes, \
                 bans.stats, bans.created_on, bans.updated_on) IS DISTINCT FROM \
                 (EXCLUDED.player_id, EXCLUDED.server_id, EXCLUDED.ban_type, EXCLUDED.expires_on, \
                 EXCLUDED.notes, EXCLUDED.stats, EXCLUDED.created_on, EXCLUDED.updated_on)",
            );
            qb.push(AFFECTED_TAIL);
            total += self.affected(qb).await.context("upsert bans")?;
        }
        Ok(total)
    }

    #[instrument(level = "debug", skip_all, fields(rows = rows.len()))]
    async fn upsert_servers(&self, rows: &[ServerRow]) -> Result<u64> {
        let mut total = 0;
        for chunk in rows.chunks(CHUNK_ROWS) {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new("WITH w AS (INSERT INTO servers (server_id, name, ip, port, owner_steamid64) ");
            qb.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.server_id)
                    .push_bind(row.name.clone())
                    .push_bind(row.ip.clone())
                    .push_bind(row.port)
                    .push_bind(row.owner_steamid64);
            });
            qb.push(
                " ON CONFLICT (server_id) DO UPDATE SET name = EXCLUDED.name, ip = EXCLUDED.ip, \
                 port = EXCLUDED.port, owner_steamid64 = EXCLUDED.owner_steamid64 \
                 WHERE (servers.name, servers.ip, servers.port, servers.owner_steamid64) IS DISTINCT FROM \
                 (EXCLUDED.name, EXCLUDED.ip, EXCLUDED.port, EXCLUDED.owner_steamid64)",
            );
            qb.push(AFFECTED_TAIL);
            total += self.affected(qb).await.context("upsert servers")?;
        }
        Ok(total)
    }

    #[instrument(level = "debug", skip_all, fields(rows = rows.len()))]
    async fn upsert_maps(&self, rows: &[MapRow]) -> Result<u64> {
        let mut total = 0;
        for chunk in rows.chunks(CHUNK_ROWS) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                "WITH w AS (INSERT INTO maps (map_id, name, filesize, validated, difficulty, created_on, updated_on) ",
            );
            qb.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.map_id)
                    .push_bind(row.name.clone())
                    .push_bind(row.filesize)
                    .push_bind(row.validated)
                    .push_bind(row.difficulty)
                    .push_bind(row.created_on)
                    .push_bind(row.updated_on);
            });
            qb.push(
                " ON CONFLICT (map_id, name) DO UPDATE SET filesize = EXCLUDED.filesize, \
                 validated = EXCLUDED.validated, difficulty = EXCLUDED.difficulty, \
                 created_on = EXCLUDED.created_on, updated_on = EXCLUDED.updated_on \
                 WHERE (maps.filesize, maps.validated, maps.difficulty, maps.created_on, maps.updated_on) \
                 IS DISTINCT FROM (EXCLUDED.filesize, EXCLUDED.validated, EXCLUDED.difficulty, \
                 EXCLUDED.created_on, EXCLUDED.updated_on)",
            );
            qb.push(AFFECTED_TAIL);
            total += self.affected(qb).await.context("upsert maps")?;
        }
        Ok(total)
    }

    #[instrument(level = "debug", skip_all, fields(rows = rows.len()))]
    async fn upsert_players(&self, rows: &[PlayerRow]) -> Result<u64> {
        let mut total = 0;
        for chunk in rows.chunks(CHUNK_ROWS) {
            let mut qb: QueryBuilder<'_, Postgres> =
                QueryBuilder::new("WITH w AS (INSERT INTO players (steamid64, steam_id, name, is_banned) ");
            qb.push_values(chunk.iter(), |mut b, row| {
                b.push_bind(row.steamid64)
                    .push_bind(row.steam_id.clone())
                    .push_bind(row.name.clone())
                    .push_bind(row.is_banned.unwrap_or(false));
            });
            qb.push(
                " ON CONFLICT (steamid64) DO UPDATE SET \
                 steam_id = COALESCE(EXCLUDED.steam_id, players.steam_id), \
                 name = EXCLUDED.name, is_banned = EXCLUDED.is_banned, updated_at = now() \
                 WHERE (COALESCE(EXCLUDED.steam_id, players.steam_id), EXCLUDED.name, EXCLUDED.is_banned) \
                 IS DISTINCT FROM (players.steam_id, players.name, players.is_banned)",
            );
            qb.push(AFFECTED_TAIL);
            total += self.affected(qb).await.context("upsert players")?;
        }
        Ok(total)
    }

    async fn max_record_id(&self) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(original_id) FROM records")
            .fetch_one(&self.pool)
            .await
            .context("max record id")?;
        Ok(max)
    }

    async fn load_checkpoint(&self, stream: &str) -> Result<Option<CheckpointState>> {
        let row: Option<CheckpointRecord> = sqlx::query_as(
            "SELECT stream, next_cursor, processed, inserted, updated, skipped, errors, updated_at \
             FROM ingest_checkpoints WHERE stream = $1",
        )
        .bind(stream)
        .fetch_optional(&self.pool)
        .await
        .context("load checkpoint")?;
        Ok(row.map(CheckpointRecord::into_state))
    }

    #[instrument(level = "debug", skip_all, fields(stream = %state.stream, cursor = state.cursor))]
    async fn save_checkpoint(&self, state: &CheckpointState) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingest_checkpoints \
             (stream, next_cursor, processed, inserted, updated, skipped, errors, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (stream) DO UPDATE SET next_cursor = EXCLUDED.next_cursor, \
             processed = EXCLUDED.processed, inserted = EXCLUDED.inserted, updated = EXCLUDED.updated, \
             skipped = EXCLUDED.skipped, errors = EXCLUDED.errors, updated_at = EXCLUDED.updated_at",
        )
        .bind(&state.stream)
        .bind(state.cursor)
        .bind(to_i64(state.processed))
        .bind(to_i64(state.inserted))
        .bind(to_i64(state.updated))
        .bind(to_i64(state.skipped))
        .bind(to_i64(state.errors))
        .bind(state.updated_at)
        .execute(&self.pool)
        .await
        .context("save checkpoint")?;
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<CheckpointState>> {
        let rows: Vec<CheckpointRecord> = sqlx::query_as(
            "SELECT stream, next_cursor, processed, inserted, updated, skipped, errors, updated_at \
             FROM ingest_checkpoints ORDER BY stream",
        )
        .fetch_all(&self.pool)
        .await
        .context("list checkpoints")?;
        Ok(rows.into_iter().map(CheckpointRecord::into_state).collect())
    }

    async fn delete_checkpoint(&self, stream: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM ingest_checkpoints WHERE stream = $1")
            .bind(stream)
            .execute(&self.pool)
            .await
            .context("delete checkpoint")?;
        Ok(res.rows_affected() > 0)
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRecord {
    stream: String,
    next_cursor: i64,
    processed: i64,
    inserted: i64,
    updated: i64,
    skipped: i64,
    errors: i64,
    updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    fn into_state(self) -> CheckpointState {
        CheckpointState {
            stream: self.stream,
            cursor: self.next_cursor,
            processed: self.processed.max(0) as u64,
            inserted: self.inserted.max(0) as u64,
            updated: self.updated.max(0) as u64,
            skipped: self.skipped.max(0) as u64,
            errors: self.errors.max(0) as u64,
            updated_at: self.updated_at,
        }
    }
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_clause_compares_against_stored_value() {
        let sql = take_if_better("pb", "clean_time", &["clean_record_id", "clean_time"]);
        assert!(sql.starts_with("clean_record_id = CASE WHEN (EXCLUDED.clean_time IS NOT NULL"));
        assert!(sql.contains("EXCLUDED.clean_time < pb.clean_time"));
        assert!(sql.ends_with("ELSE pb.clean_time END"));
    }
}
