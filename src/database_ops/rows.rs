//! Storage-ready rows. Foreign keys are surrogate ids already resolved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerRow {
    pub steamid64: i64,
    pub steam_id: Option<String>,
    pub name: String,
    /// Only known when the row comes from the players endpoint.
    pub is_banned: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapRow {
    pub map_id: i32,
    pub name: String,
    pub filesize: Option<i64>,
    pub validated: bool,
    pub difficulty: Option<i32>,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerRow {
    pub server_id: i32,
    pub name: String,
    pub ip: Option<String>,
    pub port: Option<i32>,
    pub owner_steamid64: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordRow {
    pub original_id: i64,
    pub player_id: i64,
    pub map_id: i64,
    pub server_id: i64,
    pub mode: String,
    pub stage: i32,
    pub time: f64,
    pub teleports: i32,
    pub points: i32,
    pub tickrate: i32,
    pub record_filter_id: i64,
    pub replay_id: i64,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

/// One candidate best time and the run it came from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestTime {
    pub time: f64,
    pub record_id: i64,
    pub player_id: i64,
}

impl BestTime {
    /// Keep the strictly faster of two candidates; ties keep `self`.
    pub fn better(self, other: BestTime) -> BestTime {
        if other.time < self.time {
            other
        } else {
            self
        }
    }
}

pub fn min_best(a: Option<BestTime>, b: Option<BestTime>) -> Option<BestTime> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.better(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Personal best per (player, map, mode, stage); clean and assisted merge independently.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonalBestRow {
    pub player_id: i64,
    pub map_id: i64,
    pub mode: String,
    pub stage: i32,
    pub clean: Option<BestTime>,
    pub assisted: Option<BestTime>,
}

/// Per-map world-record cache keyed by (map, mode, stage).
#[derive(Debug, Clone, PartialEq)]
pub struct WorldRecordRow {
    pub map_id: i64,
    pub mode: String,
    pub stage: i32,
    pub clean: Option<BestTime>,
    pub assisted: Option<BestTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BanRow {
    pub ban_id: i64,
    pub player_id: i64,
    pub server_id: i64,
    pub ban_type: String,
    pub expires_on: Option<DateTime<Utc>>,
    pub notes: String,
    pub stats: String,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

/// Durable progress of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub stream: String,
    /// Next id (by-id streams) or next offset (paged streams) to fetch.
    pub cursor: i64,
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub inserted: u64,
    #[serde(default)]
    pub updated: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub errors: u64,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointState {
    pub fn new(stream: &str, cursor: i64) -> Self {
        Self {
            stream: stream.to_string(),
            cursor,
            processed: 0,
            inserted: 0,
            updated: 0,
            skipped: 0,
            errors: 0,
            updated_at: Utc::now(),
        }
    }
}
