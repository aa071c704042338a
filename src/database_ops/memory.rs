//! In-process [`LeaderboardStore`] with the same conflict rules as Postgres.
//! Used by tests and by `--dry-run` style experiments.

use crate::database_ops::rows::{
    min_best, BanRow, BestTime, CheckpointState, MapRow, PersonalBestRow, PlayerRow, RecordRow,
    ServerRow, WorldRecordRow,
};
use crate::database_ops::store::LeaderboardStore;
use crate::normalization::MapKey;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
pub struct MemoryState {
    next_id: i64,
    /// steamid64 → (surrogate, row)
    pub players: BTreeMap<i64, (i64, PlayerRow)>,
    pub maps: BTreeMap<MapKey, (i64, Option<MapRow>)>,
    /// external server id → (surrogate, row)
    pub servers: BTreeMap<i32, (i64, ServerRow)>,
    pub records: BTreeMap<i64, RecordRow>,
    pub personal_bests: BTreeMap<(i64, i64, String, i32), PersonalBestRow>,
    pub world_records: BTreeMap<(i64, String, i32), WorldRecordRow>,
    pub bans: BTreeMap<i64, BanRow>,
    pub checkpoints: BTreeMap<String, CheckpointState>,
}

impl MemoryState {
    fn alloc(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_writes: AtomicU32,
    fail_checkpoints: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` record/ban/entity writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` checkpoint saves fail.
    pub fn fail_next_checkpoints(&self, n: u32) {
        self.fail_checkpoints.store(n, Ordering::SeqCst);
    }

    pub fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    pub fn player_count(&self) -> usize {
        self.lock().players.len()
    }

    pub fn map_count(&self) -> usize {
        self.lock().maps.len()
    }

    pub fn server_count(&self) -> usize {
        self.lock().servers.len()
    }

    pub fn player_id(&self, steamid64: i64) -> Option<i64> {
        self.lock().players.get(&steamid64).map(|(id, _)| *id)
    }

    pub fn personal_best(&self, player_id: i64, map_name: &str) -> Option<PersonalBestRow> {
        let st = self.lock();
        st.personal_bests
            .values()
            .find(|pb| {
                pb.player_id == player_id
                    && st
                        .maps
                        .iter()
                        .any(|(k, (id, _))| *id == pb.map_id && k.name == map_name)
            })
            .cloned()
    }

    fn check_write(&self) -> Result<()> {
        if take_failure(&self.fail_writes) {
            return Err(anyhow!("injected storage failure"));
        }
        Ok(())
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// 1 for a new key, 2 if the stored value changed, 0 otherwise.
fn put<K: Ord, V: PartialEq>(map: &mut BTreeMap<K, V>, key: K, value: V) -> u64 {
    match map.get_mut(&key) {
        None => {
            map.insert(key, value);
            1
        }
        Some(existing) if *existing != value => {
            *existing = value;
            2
        }
        Some(_) => 0,
    }
}

fn merge_variant(stored: Option<BestTime>, incoming: Option<BestTime>) -> (Option<BestTime>, bool) {
    let merged = min_best(stored, incoming);
    let improved = match (stored, incoming) {
        (None, Some(_)) => true,
        (Some(s), Some(i)) => i.time < s.time,
        _ => false,
    };
    (merged, improved)
}

#[async_trait]
impl LeaderboardStore for MemoryStore {
    async fn insert_players_ignore(&self, rows: &[PlayerRow]) -> Result<u64> {
        self.check_write()?;
        let mut guard = self.lock();
        let st = &mut *guard;
        let mut n = 0;
        for row in rows {
            if !st.players.contains_key(&row.steamid64) {
                let id = st.alloc();
                st.players.insert(row.steamid64, (id, row.clone()));
                n += 1;
            }
        }
        Ok(n)
    }

    async fn select_player_ids(&self, steamids: &[i64]) -> Result<HashMap<i64, i64>> {
        let st = self.lock();
        Ok(steamids
            .iter()
            .filter_map(|s| st.players.get(s).map(|(id, _)| (*s, *id)))
            .collect())
    }

    async fn insert_maps_ignore(&self, keys: &[MapKey]) -> Result<u64> {
        self.check_write()?;
        let mut guard = self.lock();
        let st = &mut *guard;
        let mut n = 0;
        for key in keys {
            if !st.maps.contains_key(key) {
                let id = st.alloc();
                st.maps.insert(key.clone(), (id, None));
                n += 1;
            }
        }
        Ok(n)
    }

    async fn select_map_ids(&self, keys: &[MapKey]) -> Result<HashMap<MapKey, i64>> {
        let st = self.lock();
        Ok(keys
            .iter()
            .filter_map(|k| st.maps.get(k).map(|(id, _)| (k.clone(), *id)))
            .collect())
    }

    async fn insert_servers_ignore(&self, rows: &[ServerRow]) -> Result<u64> {
        self.check_write()?;
        let mut guard = self.lock();
        let st = &mut *guard;
        let mut n = 0;
        for row in rows {
            if !st.servers.contains_key(&row.server_id) {
                let id = st.alloc();
                st.servers.insert(row.server_id, (id, row.clone()));
                n += 1;
            }
        }
        Ok(n)
    }

    async fn select_server_ids(&self, server_ids: &[i32]) -> Result<HashMap<i32, i64>> {
        let st = self.lock();
        Ok(server_ids
            .iter()
            .filter_map(|s| st.servers.get(s).map(|(id, _)| (*s, *id)))
            .collect())
    }

    async fn insert_records(&self, rows: &[RecordRow], overwrite: bool) -> Result<u64> {
        self.check_write()?;
        let mut guard = self.lock();
        let st = &mut *guard;
        let mut n = 0;
        for row in rows {
            if overwrite {
                n += put(&mut st.records, row.original_id, row.clone());
                continue;
            }
            if !st.records.contains_key(&row.original_id) {
                st.records.insert(row.original_id, row.clone());
                n += 1;
            }
        }
        Ok(n)
    }

    async fn merge_personal_bests(&self, rows: &[PersonalBestRow]) -> Result<u64> {
        self.check_write()?;
        let mut guard = self.lock();
        let st = &mut *guard;
        let mut n = 0;
        for row in rows {
            let key = (row.player_id, row.map_id, row.mode.clone(), row.stage);
            match st.personal_bests.get_mut(&key) {
                None => {
                    st.personal_bests.insert(key, row.clone());
                    n += 1;
                }
                Some(stored) => {
                    let (clean, c) = merge_variant(stored.clean, row.clean);
                    let (assisted, a) = merge_variant(stored.assisted, row.assisted);
                    stored.clean = clean;
                    stored.assisted = assisted;
                    if c || a {
                        n += 2;
                    }
                }
            }
        }
        Ok(n)
    }

    async fn merge_world_records(&self, rows: &[WorldRecordRow]) -> Result<u64> {
        self.check_write()?;
        let mut guard = self.lock();
        let st = &mut *guard;
        let mut n = 0;
        for row in rows {
            let key = (row.map_id, row.mode.clone(), row.stage);
            match st.world_records.get_mut(&key) {
                None => {
                    st.world_records.insert(key, row.clone());
                    n += 1;
                }
                Some(stored) => {
                    let (clean, c) = merge_variant(stored.clean, row.clean);
                    let (assisted, a) = merge_variant(stored.assisted, row.assisted);
                    stored.clean = clean;
                    stored.assisted = assisted;
                    if c || a {
                        n += 2;
                    }
                }
            }
        }
        Ok(n)
    }

    async fn upsert_bans(&self, rows: &[BanRow]) -> Result<u64> {
        self.check_write()?;
        let mut guard = self.lock();
        let st = &mut *guard;
        Ok(rows
            .iter()
            .map(|row| put(&mut st.bans, row.ban_id, row.clone()))
            .sum())
    }

    async fn upsert_servers(&self, rows: &[ServerRow]) -> Result<u64> {
        self.check_write()?;
        let mut guard = self.lock();
        let st = &mut *guard;
        let mut n = 0;
        for row in rows {
            n += match st.servers.get_mut(&row.server_id) {
                None => {
                    let id = st.alloc();
                    st.servers.insert(row.server_id, (id, row.clone()));
                    1
                }
                Some((_, stored)) if stored != row => {
                    *stored = row.clone();
                    2
                }
                Some(_) => 0,
            };
        }
        Ok(n)
    }

    async fn upsert_maps(&self, rows: &[MapRow]) -> Result<u64> {
        self.check_write()?;
        let mut guard = self.lock();
        let st = &mut *guard;
        let mut n = 0;
        for row in rows {
            let key = MapKey {
                map_id: row.map_id,
                name: row.name.clone(),
            };
            n += match st.maps.get_mut(&key) {
                None => {
                    let id = st.alloc();
                    st.maps.insert(key, (id, Some(row.clone())));
                    1
                }
                Some((_, stored)) if stored.as_ref() != Some(row) => {
                    *stored = Some(row.clone());
                    2
                }
                Some(_) => 0,
            };
        }
        Ok(n)
    }

    async fn upsert_players(&self, rows: &[PlayerRow]) -> Result<u64> {
        self.check_write()?;
        let mut guard = self.lock();
        let st = &mut *guard;
        let mut n = 0;
        for row in rows {
            n += match st.players.get_mut(&row.steamid64) {
                None => {
                    let id = st.alloc();
                    st.players.insert(row.steamid64, (id, row.clone()));
                    1
                }
                Some((_, stored)) => {
                    let merged = PlayerRow {
                        steam_id: row.steam_id.clone().or_else(|| stored.steam_id.clone()),
                        ..row.clone()
                    };
                    if *stored != merged {
                        *stored = merged;
                        2
                    } else {
                        0
                    }
                }
            };
        }
        Ok(n)
    }

    async fn max_record_id(&self) -> Result<Option<i64>> {
        Ok(self.lock().records.keys().next_back().copied())
    }

    async fn load_checkpoint(&self, stream: &str) -> Result<Option<CheckpointState>> {
        Ok(self.lock().checkpoints.get(stream).cloned())
    }

    async fn save_checkpoint(&self, state: &CheckpointState) -> Result<()> {
        if take_failure(&self.fail_checkpoints) {
            return Err(anyhow!("injected checkpoint failure"));
        }
        self.lock()
            .checkpoints
            .insert(state.stream.clone(), state.clone());
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<CheckpointState>> {
        Ok(self.lock().checkpoints.values().cloned().collect())
    }

    async fn delete_checkpoint(&self, stream: &str) -> Result<bool> {
        Ok(self.lock().checkpoints.remove(stream).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pb(time: f64, record_id: i64) -> PersonalBestRow {
        PersonalBestRow {
            player_id: 1,
            map_id: 2,
            mode: "kz_timer".into(),
            stage: 0,
            clean: Some(BestTime {
                time,
                record_id,
                player_id: 1,
            }),
            assisted: None,
        }
    }

    #[tokio::test]
    async fn personal_best_only_improves() {
        let store = MemoryStore::new();
        assert_eq!(store.merge_personal_bests(&[pb(12.5, 1)]).await.unwrap(), 1);
        assert_eq!(store.merge_personal_bests(&[pb(9.3, 2)]).await.unwrap(), 2);
        assert_eq!(store.merge_personal_bests(&[pb(15.0, 3)]).await.unwrap(), 0);
        let st = store.lock();
        let stored = st.personal_bests.values().next().unwrap();
        assert_eq!(stored.clean.unwrap().time, 9.3);
        assert_eq!(stored.clean.unwrap().record_id, 2);
    }

    #[tokio::test]
    async fn ban_upsert_overwrites_and_reports_unchanged() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let mut ban = BanRow {
            ban_id: 9,
            player_id: 1,
            server_id: 1,
            ban_type: "bhop_hack".into(),
            expires_on: None,
            notes: String::new(),
            stats: String::new(),
            created_on: now,
            updated_on: now,
        };
        assert_eq!(store.upsert_bans(&[ban.clone()]).await.unwrap(), 1);
        assert_eq!(store.upsert_bans(&[ban.clone()]).await.unwrap(), 0);
        ban.notes = "appealed".into();
        assert_eq!(store.upsert_bans(&[ban]).await.unwrap(), 2);
        assert_eq!(store.lock().bans[&9].notes, "appealed");
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(store.insert_maps_ignore(&[MapKey::unknown()]).await.is_err());
        assert_eq!(store.insert_maps_ignore(&[MapKey::unknown()]).await.unwrap(), 1);
        assert_eq!(store.insert_maps_ignore(&[MapKey::unknown()]).await.unwrap(), 0);
    }
}
