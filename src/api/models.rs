//! Raw payloads as returned by the remote API.
//!
//! Every field is optional and loosely typed: numbers may arrive as strings,
//! ids may be `null`, names may carry control characters. Nothing here is
//! trusted; [`crate::normalization`] turns these into storage rows.

use crate::ingest::stream::StreamKind;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawRecord {
    pub id: Option<Value>,
    pub steamid64: Option<Value>,
    pub steam_id: Option<Value>,
    pub player_name: Option<Value>,
    pub server_id: Option<Value>,
    pub server_name: Option<Value>,
    pub map_id: Option<Value>,
    pub map_name: Option<Value>,
    pub mode: Option<Value>,
    pub stage: Option<Value>,
    pub time: Option<Value>,
    pub teleports: Option<Value>,
    pub points: Option<Value>,
    pub tickrate: Option<Value>,
    pub record_filter_id: Option<Value>,
    pub replay_id: Option<Value>,
    pub created_on: Option<Value>,
    pub updated_on: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawBan {
    pub id: Option<Value>,
    pub ban_type: Option<Value>,
    pub expires_on: Option<Value>,
    pub steamid64: Option<Value>,
    pub steam_id: Option<Value>,
    pub player_name: Option<Value>,
    pub notes: Option<Value>,
    pub stats: Option<Value>,
    pub server_id: Option<Value>,
    pub created_on: Option<Value>,
    pub updated_on: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawServer {
    pub id: Option<Value>,
    pub name: Option<Value>,
    pub ip: Option<Value>,
    pub port: Option<Value>,
    pub owner_steamid64: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawMap {
    pub id: Option<Value>,
    pub name: Option<Value>,
    pub filesize: Option<Value>,
    pub validated: Option<Value>,
    pub difficulty: Option<Value>,
    pub created_on: Option<Value>,
    pub updated_on: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawPlayer {
    pub steamid64: Option<Value>,
    pub steam_id: Option<Value>,
    pub name: Option<Value>,
    pub is_banned: Option<Value>,
}

/// One untrusted element of a remote response, tagged by resource kind.
#[derive(Debug, Clone)]
pub enum ExternalRecord {
    Record(RawRecord),
    Ban(RawBan),
    Server(RawServer),
    Map(RawMap),
    Player(RawPlayer),
    /// The element was not a JSON object at all.
    Malformed(Value),
}

impl ExternalRecord {
    /// Decode one JSON element for `kind`. Never fails: anything that is not
    /// an object, or whose fields do not fit, becomes [`ExternalRecord::Malformed`].
    pub fn decode(kind: StreamKind, value: Value) -> Self {
        if !value.is_object() {
            return ExternalRecord::Malformed(value);
        }
        let decoded = match kind {
            StreamKind::Records => serde_json::from_value(value.clone()).map(ExternalRecord::Record),
            StreamKind::Bans => serde_json::from_value(value.clone()).map(ExternalRecord::Ban),
            StreamKind::Servers => serde_json::from_value(value.clone()).map(ExternalRecord::Server),
            StreamKind::Maps => serde_json::from_value(value.clone()).map(ExternalRecord::Map),
            StreamKind::Players => serde_json::from_value(value.clone()).map(ExternalRecord::Player),
        };
        decoded.unwrap_or(ExternalRecord::Malformed(value))
    }

    /// Split a response body into elements: arrays yield each item, a single
    /// object yields itself, `null` yields nothing.
    pub fn from_payload(kind: StreamKind, payload: Value) -> Vec<Self> {
        match payload {
            Value::Null => Vec::new(),
            Value::Array(items) => items.into_iter().map(|v| Self::decode(kind, v)).collect(),
            other => vec![Self::decode(kind, other)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_loosely_typed_record() {
        let rec = ExternalRecord::decode(
            StreamKind::Records,
            json!({"id": "17", "steamid64": null, "time": 12.5, "unknown_field": [1, 2]}),
        );
        let ExternalRecord::Record(raw) = rec else {
            panic!("expected record");
        };
        assert_eq!(raw.id, Some(json!("17")));
        assert!(raw.steamid64.is_none());
        assert!(raw.map_name.is_none());
    }

    #[test]
    fn non_objects_are_malformed() {
        let out = ExternalRecord::from_payload(StreamKind::Bans, json!([1, {"id": 3}, "x"]));
        assert_eq!(out.len(), 3);
        assert!(matches!(out[0], ExternalRecord::Malformed(_)));
        assert!(matches!(out[1], ExternalRecord::Ban(_)));
        assert!(matches!(out[2], ExternalRecord::Malformed(_)));
        assert!(ExternalRecord::from_payload(StreamKind::Maps, Value::Null).is_empty());
    }
}
