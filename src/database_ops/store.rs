//! The storage capability the pipeline needs.
//!
//! Write methods return an affected-row count with one convention across
//! backends: 1 per inserted row, 2 per updated row, 0 per untouched row.
//! [`crate::database_ops::writer::WriteStats::estimate`] relies on it.

use crate::database_ops::rows::{
    BanRow, CheckpointState, MapRow, PersonalBestRow, PlayerRow, RecordRow, ServerRow,
    WorldRecordRow,
};
use crate::normalization::MapKey;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

#[async_trait]
pub trait LeaderboardStore: Send + Sync {
    /// Insert players that do not exist yet; existing rows are untouched.
    async fn insert_players_ignore(&self, rows: &[PlayerRow]) -> Result<u64>;
    /// steamid64 → surrogate id for the ids that exist.
    async fn select_player_ids(&self, steamids: &[i64]) -> Result<HashMap<i64, i64>>;

    async fn insert_maps_ignore(&self, keys: &[MapKey]) -> Result<u64>;
    async fn select_map_ids(&self, keys: &[MapKey]) -> Result<HashMap<MapKey, i64>>;

    async fn insert_servers_ignore(&self, rows: &[ServerRow]) -> Result<u64>;
    /// External server id → surrogate id.
    async fn select_server_ids(&self, server_ids: &[i32]) -> Result<HashMap<i32, i64>>;

    /// Insert-ignore on `original_id`, or overwrite every column when `overwrite`.
    async fn insert_records(&self, rows: &[RecordRow], overwrite: bool) -> Result<u64>;
    /// Keep the strictly smaller time per variant.
    async fn merge_personal_bests(&self, rows: &[PersonalBestRow]) -> Result<u64>;
    async fn merge_world_records(&self, rows: &[WorldRecordRow]) -> Result<u64>;

    /// Last-write-wins upserts for mutable upstream entities.
    async fn upsert_bans(&self, rows: &[BanRow]) -> Result<u64>;
    async fn upsert_servers(&self, rows: &[ServerRow]) -> Result<u64>;
    async fn upsert_maps(&self, rows: &[MapRow]) -> Result<u64>;
    async fn upsert_players(&self, rows: &[PlayerRow]) -> Result<u64>;

    /// Highest remote record id already stored.
    async fn max_record_id(&self) -> Result<Option<i64>>;

    async fn load_checkpoint(&self, stream: &str) -> Result<Option<CheckpointState>>;
    async fn save_checkpoint(&self, state: &CheckpointState) -> Result<()>;
    async fn list_checkpoints(&self) -> Result<Vec<CheckpointState>>;
    async fn delete_checkpoint(&self, stream: &str) -> Result<bool>;
}
