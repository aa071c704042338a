//! Timestamp parsing and clamping to the storage-representable range.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

const FLOOR_SECS: i64 = 1;
const CEILING_SECS: i64 = 2_147_483_647;

/// Earliest storable instant: 1970-01-01T00:00:01Z.
pub fn floor() -> DateTime<Utc> {
    Utc.timestamp_opt(FLOOR_SECS, 0).single().unwrap_or_default()
}

/// Latest storable instant: 2038-01-19T03:14:07Z.
pub fn ceiling() -> DateTime<Utc> {
    Utc.timestamp_opt(CEILING_SECS, 0).single().unwrap_or_default()
}

pub fn clamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.clamp(floor(), ceiling())
}

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse the formats the API is known to emit. Naive values are read as UTC.
pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
    }
    raw.parse::<i64>().ok().and_then(from_unix)
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    // Out-of-range seconds still clamp rather than vanish.
    if secs < FLOOR_SECS {
        return Some(floor());
    }
    if secs > CEILING_SECS {
        return Some(ceiling());
    }
    Utc.timestamp_opt(secs, 0).single()
}

/// Missing or unparseable values map to the floor; everything is clamped.
pub fn normalize(value: Option<&Value>) -> DateTime<Utc> {
    let parsed = match value {
        Some(Value::String(s)) => parse(s),
        Some(Value::Number(n)) => n.as_i64().and_then(from_unix),
        _ => None,
    };
    parsed.map(clamp).unwrap_or_else(floor)
}

/// Like [`normalize`] but keeps absence distinct (e.g. a ban without expiry).
pub fn normalize_opt(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value {
        None | Some(Value::Null) => None,
        Some(v) => Some(normalize(Some(v))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clamps_to_sentinels() {
        assert_eq!(normalize(Some(&json!("1899-05-01T00:00:00Z"))), floor());
        assert_eq!(normalize(Some(&json!("2099-01-01T00:00:00"))), ceiling());
        assert_eq!(floor().to_rfc3339(), "1970-01-01T00:00:01+00:00");
        assert_eq!(ceiling().to_rfc3339(), "2038-01-19T03:14:07+00:00");
    }

    #[test]
    fn well_formed_is_lossless() {
        let ts = normalize(Some(&json!("2024-03-01T12:00:00Z")));
        assert_eq!(ts, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn accepts_naive_and_unix_forms() {
        let want = Utc.with_ymd_and_hms(2019, 6, 2, 8, 30, 0).unwrap();
        assert_eq!(normalize(Some(&json!("2019-06-02T08:30:00"))), want);
        assert_eq!(normalize(Some(&json!("2019-06-02 08:30:00"))), want);
        assert_eq!(normalize(Some(&json!(want.timestamp()))), want);
    }

    #[test]
    fn missing_or_garbage_maps_to_floor() {
        assert_eq!(normalize(None), floor());
        assert_eq!(normalize(Some(&json!("not a date"))), floor());
        assert_eq!(normalize_opt(Some(&Value::Null)), None);
    }
}
