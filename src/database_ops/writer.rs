//! Turns a normalized batch into storage writes.
//!
//! A batch goes through two phases: [`BatchWriter::resolve`] gets surrogate ids
//! for every referenced entity, then [`BatchWriter::write`] issues the
//! multi-row statements. No row is written before its references exist.

use crate::database_ops::resolver::EntityResolver;
use crate::database_ops::rows::{
    min_best, BanRow, BestTime, MapRow, PersonalBestRow, PlayerRow, RecordRow, ServerRow,
    WorldRecordRow,
};
use crate::database_ops::store::LeaderboardStore;
use crate::normalization::record::{NormalizedBan, NormalizedRecord};
use crate::normalization::{MapKey, NormalizedRow, PlayerCandidate, ServerCandidate};
use anyhow::{Context, Result};
use indexmap::IndexMap;
use itertools::Itertools;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Inserted/updated/skipped attribution for one write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl WriteStats {
    /// Estimate from an aggregate affected-row count under the 1/2/0
    /// convention. With `a = i + 2u` and `i + u <= n`, `u >= a - n`; taking the
    /// lower bound attributes as much as possible to inserts. Telemetry only.
    pub fn estimate(affected: u64, batch: u64) -> Self {
        let updated = affected.saturating_sub(batch);
        let inserted = affected.saturating_sub(updated * 2).min(batch);
        let skipped = batch.saturating_sub(inserted + updated);
        Self {
            inserted,
            updated,
            skipped,
        }
    }

    pub fn add(&mut self, other: WriteStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

/// Everything one batch will write, with references resolved.
#[derive(Debug, Default, Clone)]
pub struct ResolvedBatch {
    pub records: Vec<RecordRow>,
    pub personal_bests: Vec<PersonalBestRow>,
    pub world_records: Vec<WorldRecordRow>,
    pub bans: Vec<BanRow>,
    pub servers: Vec<ServerRow>,
    pub maps: Vec<MapRow>,
    pub players: Vec<PlayerRow>,
    /// Rows dropped as within-batch duplicates of an earlier external key.
    pub duplicates: u64,
}

impl ResolvedBatch {
    /// Rows subject to the primary write (bests are derived, not counted).
    pub fn primary_len(&self) -> usize {
        self.records.len() + self.bans.len() + self.servers.len() + self.maps.len() + self.players.len()
    }
}

/// Keep the first occurrence of each external key.
pub fn dedupe(rows: Vec<NormalizedRow>) -> (Vec<NormalizedRow>, u64) {
    let mut seen = HashSet::new();
    let mut dropped = 0;
    let kept = rows
        .into_iter()
        .filter(|row| {
            let fresh = seen.insert(row.external_key());
            if !fresh {
                dropped += 1;
            }
            fresh
        })
        .collect();
    (kept, dropped)
}

pub struct BatchWriter {
    store: Arc<dyn LeaderboardStore>,
    overwrite_records: bool,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn LeaderboardStore>, overwrite_records: bool) -> Self {
        Self {
            store,
            overwrite_records,
        }
    }

    pub async fn resolve(
        &self,
        resolver: &mut EntityResolver,
        rows: Vec<NormalizedRow>,
    ) -> Result<ResolvedBatch> {
        let (rows, duplicates) = dedupe(rows);
        let mut out = ResolvedBatch {
            duplicates,
            ..Default::default()
        };

        let mut records = Vec::new();
        let mut bans = Vec::new();
        for row in rows {
            match row {
                NormalizedRow::Record(r) => records.push(r),
                NormalizedRow::Ban(b) => bans.push(b),
                NormalizedRow::Server(s) => out.servers.push(ServerRow {
                    server_id: s.server_id,
                    name: s.name,
                    ip: s.ip,
                    port: s.port,
                    owner_steamid64: s.owner_steamid64,
                }),
                NormalizedRow::Map(m) => out.maps.push(MapRow {
                    map_id: m.key.map_id,
                    name: m.key.name,
                    filesize: m.filesize,
                    validated: m.validated,
                    difficulty: m.difficulty,
                    created_on: m.created_on,
                    updated_on: m.updated_on,
                }),
                NormalizedRow::Player(p) => out.players.push(PlayerRow {
                    steamid64: p.player.steamid64,
                    steam_id: p.player.steam_id,
                    name: p.player.name,
                    is_banned: Some(p.is_banned),
                }),
            }
        }

        if !records.is_empty() {
            self.resolve_records(resolver, &records, &mut out)
                .await
                .context("resolve record references")?;
        }
        if !bans.is_empty() {
            self.resolve_bans(resolver, &bans, &mut out)
                .await
                .context("resolve ban references")?;
        }
        Ok(out)
    }

    async fn resolve_records(
        &self,
        resolver: &mut EntityResolver,
        records: &[NormalizedRecord],
        out: &mut ResolvedBatch,
    ) -> Result<()> {
        let players: Vec<PlayerCandidate> = records.iter().map(|r| r.player.clone()).collect();
        let maps: Vec<MapKey> = records.iter().map(|r| r.map.clone()).collect();
        let servers: Vec<ServerCandidate> = records.iter().map(|r| r.server.clone()).collect();
        let player_ids = resolver.resolve_players(&players).await?;
        let map_ids = resolver.resolve_maps(&maps).await?;
        let server_ids = resolver.resolve_servers(&servers).await?;

        let mut pbs: IndexMap<(i64, i64, String, i32), PersonalBestRow> = IndexMap::new();
        let mut wrs: IndexMap<(i64, String, i32), WorldRecordRow> = IndexMap::new();

        for r in records {
            let player_id = player_ids[&r.player.steamid64];
            let map_id = map_ids[&r.map];
            out.records.push(RecordRow {
                original_id: r.record_id,
                player_id,
                map_id,
                server_id: server_ids[&r.server.server_id],
                mode: r.mode.clone(),
                stage: r.stage,
                time: r.time,
                teleports: r.teleports,
                points: r.points,
                tickrate: r.tickrate,
                record_filter_id: r.record_filter_id,
                replay_id: r.replay_id,
                created_on: r.created_on,
                updated_on: r.updated_on,
            });

            if !r.has_valid_time() {
                continue;
            }
            let best = BestTime {
                time: r.time,
                record_id: r.record_id,
                player_id,
            };
            let (clean, assisted) = if r.is_clean() {
                (Some(best), None)
            } else {
                (None, Some(best))
            };

            let pb = pbs
                .entry((player_id, map_id, r.mode.clone(), r.stage))
                .or_insert_with(|| PersonalBestRow {
                    player_id,
                    map_id,
                    mode: r.mode.clone(),
                    stage: r.stage,
                    clean: None,
                    assisted: None,
                });
            pb.clean = min_best(pb.clean, clean);
            pb.assisted = min_best(pb.assisted, assisted);

            let wr = wrs
                .entry((map_id, r.mode.clone(), r.stage))
                .or_insert_with(|| WorldRecordRow {
                    map_id,
                    mode: r.mode.clone(),
                    stage: r.stage,
                    clean: None,
                    assisted: None,
                });
            wr.clean = min_best(wr.clean, clean);
            wr.assisted = min_best(wr.assisted, assisted);
        }

        out.personal_bests = pbs.into_values().collect();
        out.world_records = wrs.into_values().collect();
        Ok(())
    }

    async fn resolve_bans(
        &self,
        resolver: &mut EntityResolver,
        bans: &[NormalizedBan],
        out: &mut ResolvedBatch,
    ) -> Result<()> {
        let players: Vec<PlayerCandidate> = bans.iter().map(|b| b.player.clone()).collect();
        let servers: Vec<ServerCandidate> = bans.iter().map(|b| b.server.clone()).collect();
        let player_ids = resolver.resolve_players(&players).await?;
        let server_ids = resolver.resolve_servers(&servers).await?;
        out.bans.extend(bans.iter().map(|b| BanRow {
            ban_id: b.ban_id,
            player_id: player_ids[&b.player.steamid64],
            server_id: server_ids[&b.server.server_id],
            ban_type: b.ban_type.clone(),
            expires_on: b.expires_on,
            notes: b.notes.clone(),
            stats: b.stats.clone(),
            created_on: b.created_on,
            updated_on: b.updated_on,
        }));
        Ok(())
    }

    /// Issue every statement for `batch`. Safe to repeat after a failure:
    /// each statement is idempotent under its conflict rule.
    pub async fn write(&self, batch: &ResolvedBatch) -> Result<WriteStats> {
        let mut stats = WriteStats {
            skipped: batch.duplicates,
            ..Default::default()
        };

        if !batch.records.is_empty() {
            let affected = self
                .store
                .insert_records(&batch.records, self.overwrite_records)
                .await
                .context("insert records")?;
            stats.add(WriteStats::estimate(affected, batch.records.len() as u64));
        }
        if !batch.personal_bests.is_empty() {
            let changed = self
                .store
                .merge_personal_bests(&batch.personal_bests)
                .await
                .context("merge personal bests")?;
            debug!(rows = batch.personal_bests.len(), changed, "merged personal bests");
        }
        if !batch.world_records.is_empty() {
            let changed = self
                .store
                .merge_world_records(&batch.world_records)
                .await
                .context("merge world records")?;
            debug!(rows = batch.world_records.len(), changed, "merged world records");
        }
        if !batch.bans.is_empty() {
            let affected = self.store.upsert_bans(&batch.bans).await.context("upsert bans")?;
            stats.add(WriteStats::estimate(affected, batch.bans.len() as u64));
        }
        if !batch.servers.is_empty() {
            let affected = self
                .store
                .upsert_servers(&batch.servers)
                .await
                .context("upsert servers")?;
            stats.add(WriteStats::estimate(affected, batch.servers.len() as u64));
        }
        if !batch.maps.is_empty() {
            let affected = self.store.upsert_maps(&batch.maps).await.context("upsert maps")?;
            stats.add(WriteStats::estimate(affected, batch.maps.len() as u64));
        }
        if !batch.players.is_empty() {
            let affected = self
                .store
                .upsert_players(&batch.players)
                .await
                .context("upsert players")?;
            stats.add(WriteStats::estimate(affected, batch.players.len() as u64));
        }
        Ok(stats)
    }
}

/// Record id span of a batch for log lines.
pub fn describe_ids(batch: &ResolvedBatch) -> String {
    match batch.records.iter().map(|r| r.original_id).minmax().into_option() {
        Some((lo, hi)) => format!("{lo}..={hi}"),
        None => "-".to_string(),
    }
}
