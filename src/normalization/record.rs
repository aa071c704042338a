//! Raw API elements → storage-ready rows, or a reason they cannot be stored.

use crate::api::models::{ExternalRecord, RawBan, RawMap, RawPlayer, RawRecord, RawServer};
use crate::normalization::sanitize::{
    coerce_bool, coerce_f64, coerce_i32, coerce_i64, parse_steamid64,
    placeholder_steamid64, sanitize_opt, sanitize_text, steamid2_to_64, PlaceholderSource,
};
use crate::normalization::timestamp;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_MODE: &str = "kz_timer";
pub const UNKNOWN_MAP_ID: i32 = -1;
pub const UNKNOWN_MAP_NAME: &str = "unknown_map";
pub const UNKNOWN_SERVER_ID: i32 = -1;
pub const UNKNOWN_SERVER_NAME: &str = "unknown_server";
pub const UNKNOWN_PLAYER_NAME: &str = "unknown_player";
pub const DEFAULT_TICKRATE: i32 = 128;

const MODE_MAX: usize = 32;
const PLAYER_NAME_MAX: usize = 128;
const MAP_NAME_MAX: usize = 128;
const SERVER_NAME_MAX: usize = 255;
const STEAM_ID_MAX: usize = 32;
const BAN_TYPE_MAX: usize = 64;
const NOTES_MAX: usize = 1024;
const IP_MAX: usize = 64;
const STAGE_MAX: i32 = 100;
const POINTS_MAX: i32 = 1000;

/// Player identity as derived from a record or ban.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerCandidate {
    pub steamid64: i64,
    pub steam_id: Option<String>,
    pub name: String,
    /// True when `steamid64` was synthesized.
    pub synthetic: bool,
}

/// Composite map identity `(external id, sanitized name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapKey {
    pub map_id: i32,
    pub name: String,
}

impl MapKey {
    pub fn unknown() -> Self {
        Self {
            map_id: UNKNOWN_MAP_ID,
            name: UNKNOWN_MAP_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCandidate {
    pub server_id: i32,
    pub name: String,
}

impl ServerCandidate {
    pub fn unknown() -> Self {
        Self {
            server_id: UNKNOWN_SERVER_ID,
            name: UNKNOWN_SERVER_NAME.to_string(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.server_id == UNKNOWN_SERVER_ID
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub record_id: i64,
    pub player: PlayerCandidate,
    pub map: MapKey,
    pub server: ServerCandidate,
    pub mode: String,
    pub stage: i32,
    /// Seconds; `0.0` when the source time was missing or not positive.
    pub time: f64,
    pub teleports: i32,
    pub points: i32,
    pub tickrate: i32,
    pub record_filter_id: i64,
    pub replay_id: i64,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

impl NormalizedRecord {
    /// Rows without a usable time are stored but never compete for bests.
    pub fn has_valid_time(&self) -> bool {
        self.time > 0.0
    }

    /// Zero-teleport ("pro") run.
    pub fn is_clean(&self) -> bool {
        self.teleports == 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBan {
    pub ban_id: i64,
    pub ban_type: String,
    pub expires_on: Option<DateTime<Utc>>,
    pub player: PlayerCandidate,
    pub notes: String,
    pub stats: String,
    pub server: ServerCandidate,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedServer {
    pub server_id: i32,
    pub name: String,
    pub ip: Option<String>,
    pub port: Option<i32>,
    pub owner_steamid64: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMap {
    pub key: MapKey,
    pub filesize: Option<i64>,
    pub validated: bool,
    pub difficulty: Option<i32>,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPlayer {
    pub player: PlayerCandidate,
    pub is_banned: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedRow {
    Record(NormalizedRecord),
    Ban(NormalizedBan),
    Server(NormalizedServer),
    Map(NormalizedMap),
    Player(NormalizedPlayer),
}

impl NormalizedRow {
    /// External natural key used for within-batch dedupe.
    pub fn external_key(&self) -> String {
        match self {
            NormalizedRow::Record(r) => r.record_id.to_string(),
            NormalizedRow::Ban(b) => b.ban_id.to_string(),
            NormalizedRow::Server(s) => s.server_id.to_string(),
            NormalizedRow::Map(m) => format!("{}:{}", m.key.map_id, m.key.name),
            NormalizedRow::Player(p) => p.player.steamid64.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("element is not a JSON object")]
    Malformed,
    #[error("missing or non-positive {0}")]
    MissingId(&'static str),
    #[error("map has neither id nor name")]
    MissingMapIdentity,
    #[error("player has no usable steam identity")]
    MissingPlayerIdentity,
}

/// Output of [`BatchNormalizer::normalize_batch`].
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub rows: Vec<NormalizedRow>,
    pub rejected: Vec<RejectReason>,
}

/// Stateless per-element normalizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchNormalizer;

impl BatchNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, raw: &ExternalRecord) -> Result<NormalizedRow, RejectReason> {
        match raw {
            ExternalRecord::Record(r) => self.record(r).map(NormalizedRow::Record),
            ExternalRecord::Ban(b) => self.ban(b).map(NormalizedRow::Ban),
            ExternalRecord::Server(s) => self.server(s).map(NormalizedRow::Server),
            ExternalRecord::Map(m) => self.map(m).map(NormalizedRow::Map),
            ExternalRecord::Player(p) => self.player(p).map(NormalizedRow::Player),
            ExternalRecord::Malformed(_) => Err(RejectReason::Malformed),
        }
    }

    pub fn normalize_batch(&self, raws: &[ExternalRecord]) -> NormalizedBatch {
        let mut out = NormalizedBatch::default();
        for raw in raws {
            match self.normalize(raw) {
                Ok(row) => out.rows.push(row),
                Err(reason) => {
                    debug!(%reason, "rejected element");
                    out.rejected.push(reason);
                }
            }
        }
        out
    }

    fn record(&self, r: &RawRecord) -> Result<NormalizedRecord, RejectReason> {
        let record_id = positive_id(r.id.as_ref(), "record id")?;
        let player = player_candidate(
            r.steamid64.as_ref(),
            r.steam_id.as_ref(),
            r.player_name.as_ref(),
            PlaceholderSource::Record(record_id),
        );
        let map = map_key(r.map_id.as_ref(), r.map_name.as_ref()).unwrap_or_else(MapKey::unknown);
        let server = server_candidate(r.server_id.as_ref(), r.server_name.as_ref());
        let time = coerce_f64(r.time.as_ref()).filter(|t| *t > 0.0).unwrap_or(0.0);

        Ok(NormalizedRecord {
            record_id,
            player,
            map,
            server,
            mode: mode(r.mode.as_ref()),
            stage: coerce_i32(r.stage.as_ref()).unwrap_or(0).clamp(0, STAGE_MAX),
            time,
            teleports: coerce_i32(r.teleports.as_ref()).unwrap_or(0).max(0),
            points: coerce_i32(r.points.as_ref()).unwrap_or(0).clamp(0, POINTS_MAX),
            tickrate: coerce_i32(r.tickrate.as_ref())
                .filter(|t| *t > 0)
                .unwrap_or(DEFAULT_TICKRATE),
            record_filter_id: coerce_i64(r.record_filter_id.as_ref()).unwrap_or(0).max(0),
            replay_id: coerce_i64(r.replay_id.as_ref()).unwrap_or(0).max(0),
            created_on: timestamp::normalize(r.created_on.as_ref()),
            updated_on: timestamp::normalize(r.updated_on.as_ref().or(r.created_on.as_ref())),
        })
    }

    fn ban(&self, b: &RawBan) -> Result<NormalizedBan, RejectReason> {
        let ban_id = positive_id(b.id.as_ref(), "ban id")?;
        Ok(NormalizedBan {
            ban_id,
            ban_type: sanitize_text(b.ban_type.as_ref(), BAN_TYPE_MAX, "none"),
            expires_on: timestamp::normalize_opt(b.expires_on.as_ref()),
            player: player_candidate(
                b.steamid64.as_ref(),
                b.steam_id.as_ref(),
                b.player_name.as_ref(),
                PlaceholderSource::Ban(ban_id),
            ),
            notes: sanitize_text(b.notes.as_ref(), NOTES_MAX, ""),
            stats: sanitize_text(b.stats.as_ref(), NOTES_MAX, ""),
            server: server_candidate(b.server_id.as_ref(), None),
            created_on: timestamp::normalize(b.created_on.as_ref()),
            updated_on: timestamp::normalize(b.updated_on.as_ref().or(b.created_on.as_ref())),
        })
    }

    fn server(&self, s: &RawServer) -> Result<NormalizedServer, RejectReason> {
        let server_id = coerce_i32(s.id.as_ref())
            .filter(|id| *id > 0)
            .ok_or(RejectReason::MissingId("server id"))?;
        Ok(NormalizedServer {
            server_id,
            name: sanitize_text(s.name.as_ref(), SERVER_NAME_MAX, UNKNOWN_SERVER_NAME),
            ip: sanitize_opt(s.ip.as_ref(), IP_MAX),
            port: coerce_i32(s.port.as_ref()).filter(|p| (1..=65535).contains(p)),
            owner_steamid64: parse_steamid64(s.owner_steamid64.as_ref()),
        })
    }

    fn map(&self, m: &RawMap) -> Result<NormalizedMap, RejectReason> {
        let key = map_key(m.id.as_ref(), m.name.as_ref()).ok_or(RejectReason::MissingMapIdentity)?;
        Ok(NormalizedMap {
            key,
            filesize: coerce_i64(m.filesize.as_ref()).filter(|s| *s >= 0),
            validated: coerce_bool(m.validated.as_ref()).unwrap_or(false),
            difficulty: coerce_i32(m.difficulty.as_ref()),
            created_on: timestamp::normalize(m.created_on.as_ref()),
            updated_on: timestamp::normalize(m.updated_on.as_ref().or(m.created_on.as_ref())),
        })
    }

    fn player(&self, p: &RawPlayer) -> Result<NormalizedPlayer, RejectReason> {
        let steam_id = sanitize_opt(p.steam_id.as_ref(), STEAM_ID_MAX);
        let steamid64 = parse_steamid64(p.steamid64.as_ref())
            .or_else(|| steam_id.as_deref().and_then(steamid2_to_64))
            .ok_or(RejectReason::MissingPlayerIdentity)?;
        Ok(NormalizedPlayer {
            player: PlayerCandidate {
                steamid64,
                steam_id,
                name: sanitize_text(p.name.as_ref(), PLAYER_NAME_MAX, UNKNOWN_PLAYER_NAME),
                synthetic: false,
            },
            is_banned: coerce_bool(p.is_banned.as_ref()).unwrap_or(false),
        })
    }
}

fn positive_id(value: Option<&Value>, what: &'static str) -> Result<i64, RejectReason> {
    coerce_i64(value)
        .filter(|id| *id > 0)
        .ok_or(RejectReason::MissingId(what))
}

fn mode(value: Option<&Value>) -> String {
    sanitize_opt(value, MODE_MAX)
        .map(|m| m.to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_MODE.to_string())
}

/// Genuine steamid64, else SteamID2 recovery, else a placeholder from `source`.
fn player_candidate(
    steamid64: Option<&Value>,
    steam_id: Option<&Value>,
    name: Option<&Value>,
    source: PlaceholderSource,
) -> PlayerCandidate {
    let steam_id = sanitize_opt(steam_id, STEAM_ID_MAX);
    let name = sanitize_text(name, PLAYER_NAME_MAX, UNKNOWN_PLAYER_NAME);
    let genuine = parse_steamid64(steamid64).or_else(|| steam_id.as_deref().and_then(steamid2_to_64));
    match genuine {
        Some(steamid64) => PlayerCandidate {
            steamid64,
            steam_id,
            name,
            synthetic: false,
        },
        None => PlayerCandidate {
            steamid64: placeholder_steamid64(source),
            steam_id,
            name,
            synthetic: true,
        },
    }
}

/// `None` only when both id and name are absent.
fn map_key(id: Option<&Value>, name: Option<&Value>) -> Option<MapKey> {
    let map_id = coerce_i32(id).filter(|id| *id > 0);
    let name = sanitize_opt(name, MAP_NAME_MAX).map(|n| n.to_ascii_lowercase());
    if map_id.is_none() && name.is_none() {
        return None;
    }
    Some(MapKey {
        map_id: map_id.unwrap_or(UNKNOWN_MAP_ID),
        name: name.unwrap_or_else(|| UNKNOWN_MAP_NAME.to_string()),
    })
}

fn server_candidate(id: Option<&Value>, name: Option<&Value>) -> ServerCandidate {
    match coerce_i32(id).filter(|id| *id > 0) {
        Some(server_id) => ServerCandidate {
            server_id,
            name: sanitize_text(name, SERVER_NAME_MAX, UNKNOWN_SERVER_NAME),
        },
        None => ServerCandidate::unknown(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::stream::StreamKind;
    use crate::normalization::sanitize::RESERVED_BASE;
    use serde_json::json;

    fn norm(kind: StreamKind, v: Value) -> Result<NormalizedRow, RejectReason> {
        BatchNormalizer::new().normalize(&ExternalRecord::decode(kind, v))
    }

    fn record(v: Value) -> NormalizedRecord {
        match norm(StreamKind::Records, v) {
            Ok(NormalizedRow::Record(r)) => r,
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn record_defaults_and_clamps() {
        let r = record(json!({
            "id": "42",
            "steamid64": null,
            "map_name": " KZ_X ",
            "stage": 250,
            "points": 5000,
            "teleports": -3,
            "time": "-1",
            "mode": "",
        }));
        assert_eq!(r.record_id, 42);
        assert!(r.player.synthetic);
        assert_eq!(r.player.steamid64, RESERVED_BASE + 42);
        assert_eq!(r.map, MapKey { map_id: -1, name: "kz_x".into() });
        assert!(r.server.is_unknown());
        assert_eq!(r.stage, 100);
        assert_eq!(r.points, 1000);
        assert_eq!(r.teleports, 0);
        assert_eq!(r.time, 0.0);
        assert!(!r.has_valid_time());
        assert_eq!(r.mode, DEFAULT_MODE);
        assert_eq!(r.tickrate, DEFAULT_TICKRATE);
        assert_eq!(r.created_on, timestamp::floor());
    }

    #[test]
    fn recovers_steamid_from_steam2() {
        let r = record(json!({"id": 5, "steamid64": "junk", "steam_id": "STEAM_1:0:10", "time": 9.5}));
        assert!(!r.player.synthetic);
        assert_eq!(r.player.steamid64, 76_561_197_960_265_748);
        assert!(r.is_clean());
    }

    #[test]
    fn rejects_missing_identity() {
        assert_eq!(
            norm(StreamKind::Records, json!({"time": 3.0})),
            Err(RejectReason::MissingId("record id"))
        );
        assert_eq!(
            norm(StreamKind::Bans, json!({"id": 0})),
            Err(RejectReason::MissingId("ban id"))
        );
        assert_eq!(
            norm(StreamKind::Maps, json!({"filesize": 10})),
            Err(RejectReason::MissingMapIdentity)
        );
        assert_eq!(
            norm(StreamKind::Players, json!({"name": "x"})),
            Err(RejectReason::MissingPlayerIdentity)
        );
        assert_eq!(
            norm(StreamKind::Servers, json!({"id": -4})),
            Err(RejectReason::MissingId("server id"))
        );
        assert_eq!(norm(StreamKind::Records, json!(17)), Err(RejectReason::Malformed));
    }

    #[test]
    fn ban_placeholder_differs_from_record_placeholder() {
        let Ok(NormalizedRow::Ban(b)) = norm(StreamKind::Bans, json!({"id": 42, "ban_type": "bhop_hack"}))
        else {
            panic!("expected ban");
        };
        assert!(b.player.synthetic);
        assert_ne!(b.player.steamid64, RESERVED_BASE + 42);
        assert_eq!(b.expires_on, None);
    }

    #[test]
    fn batch_counts_rejections() {
        let raws = ExternalRecord::from_payload(
            StreamKind::Records,
            json!([{"id": 1, "time": 2.0}, null, {"id": "x"}]),
        );
        let batch = BatchNormalizer::new().normalize_batch(&raws);
        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rejected.len(), 2);
    }
}
