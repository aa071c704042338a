//! Natural key → surrogate id resolution with a per-pipeline cache.
//!
//! Unknown keys are inserted in ascending key order so concurrent streams
//! lock overlapping rows in the same order.

use crate::database_ops::rows::{PlayerRow, ServerRow};
use crate::database_ops::store::LeaderboardStore;
use crate::normalization::{MapKey, PlayerCandidate, ServerCandidate};
use anyhow::{bail, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Resolved ids, owned by one [`EntityResolver`]. Dropped with the pipeline.
#[derive(Debug, Default, Clone)]
pub struct EntityCache {
    pub players: HashMap<i64, i64>,
    pub maps: HashMap<MapKey, i64>,
    pub servers: HashMap<i32, i64>,
}

pub struct EntityResolver {
    store: Arc<dyn LeaderboardStore>,
    cache: EntityCache,
}

impl EntityResolver {
    pub fn new(store: Arc<dyn LeaderboardStore>) -> Self {
        Self {
            store,
            cache: EntityCache::default(),
        }
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    /// steamid64 → player surrogate id for every candidate.
    pub async fn resolve_players(
        &mut self,
        candidates: &[PlayerCandidate],
    ) -> Result<HashMap<i64, i64>> {
        let mut unknown: BTreeMap<i64, PlayerRow> = BTreeMap::new();
        for c in candidates {
            if !self.cache.players.contains_key(&c.steamid64) {
                unknown.entry(c.steamid64).or_insert_with(|| PlayerRow {
                    steamid64: c.steamid64,
                    steam_id: c.steam_id.clone(),
                    name: c.name.clone(),
                    is_banned: None,
                });
            }
        }
        if !unknown.is_empty() {
            let rows: Vec<PlayerRow> = unknown.into_values().collect();
            let created = self.store.insert_players_ignore(&rows).await?;
            let keys: Vec<i64> = rows.iter().map(|r| r.steamid64).collect();
            let found = self.store.select_player_ids(&keys).await?;
            let synthetic = candidates.iter().filter(|c| c.synthetic).count();
            debug!(requested = keys.len(), created, synthetic, "resolved players");
            self.cache.players.extend(found);
        }
        collect(candidates.iter().map(|c| c.steamid64), &self.cache.players, "player")
    }

    pub async fn resolve_maps(&mut self, keys: &[MapKey]) -> Result<HashMap<MapKey, i64>> {
        let mut unknown: Vec<MapKey> = keys
            .iter()
            .filter(|k| !self.cache.maps.contains_key(*k))
            .cloned()
            .collect();
        unknown.sort();
        unknown.dedup();
        if !unknown.is_empty() {
            let created = self.store.insert_maps_ignore(&unknown).await?;
            let found = self.store.select_map_ids(&unknown).await?;
            debug!(requested = unknown.len(), created, "resolved maps");
            self.cache.maps.extend(found);
        }
        collect(keys.iter().cloned(), &self.cache.maps, "map")
    }

    /// External server id → surrogate id; unknown servers share one row.
    pub async fn resolve_servers(
        &mut self,
        candidates: &[ServerCandidate],
    ) -> Result<HashMap<i32, i64>> {
        let mut unknown: BTreeMap<i32, ServerRow> = BTreeMap::new();
        for c in candidates {
            if !self.cache.servers.contains_key(&c.server_id) {
                unknown.entry(c.server_id).or_insert_with(|| ServerRow {
                    server_id: c.server_id,
                    name: c.name.clone(),
                    ip: None,
                    port: None,
                    owner_steamid64: None,
                });
            }
        }
        if !unknown.is_empty() {
            let rows: Vec<ServerRow> = unknown.into_values().collect();
            let created = self.store.insert_servers_ignore(&rows).await?;
            let keys: Vec<i32> = rows.iter().map(|r| r.server_id).collect();
            let found = self.store.select_server_ids(&keys).await?;
            debug!(requested = keys.len(), created, "resolved servers");
            self.cache.servers.extend(found);
        }
        collect(candidates.iter().map(|c| c.server_id), &self.cache.servers, "server")
    }
}

fn collect<K>(
    keys: impl Iterator<Item = K>,
    cache: &HashMap<K, i64>,
    what: &str,
) -> Result<HashMap<K, i64>>
where
    K: std::hash::Hash + Eq + std::fmt::Debug,
{
    let mut out = HashMap::new();
    for k in keys {
        match cache.get(&k) {
            Some(id) => {
                out.insert(k, *id);
            }
            None => bail!("{what} {k:?} missing after insert-or-select"),
        }
    }
    Ok(out)
}
