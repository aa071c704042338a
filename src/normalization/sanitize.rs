//! Coercion of untrusted JSON scalars and Steam identity handling.

use rand::Rng;
use serde_json::Value;

/// SteamID64 of account 0 in the public universe; genuine ids are above it.
pub const STEAMID64_BASE: i64 = 76_561_197_960_265_728;

/// Start of the synthetic steamid64 range. Nothing real lives at or above it.
pub const RESERVED_BASE: i64 = 9_000_000_000_000_000_000;

/// Width of each deterministic placeholder sub-range.
const PLACEHOLDER_SPAN: i64 = 1 << 55;
const BAN_PLACEHOLDER_BASE: i64 = RESERVED_BASE + PLACEHOLDER_SPAN;
const RANDOM_PLACEHOLDER_BASE: i64 = RESERVED_BASE + (1 << 56);
const RANDOM_PLACEHOLDER_END: i64 = RESERVED_BASE + (1 << 57);

/// Render a scalar as text; objects, arrays and null give `None`.
fn scalar_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Trim, drop NUL and control characters, cap at `max_chars`, and fall back
/// to `default` when nothing printable is left.
pub fn sanitize_text(value: Option<&Value>, max_chars: usize, default: &str) -> String {
    scalar_text(value)
        .and_then(|raw| clean_str(&raw, max_chars))
        .unwrap_or_else(|| default.to_string())
}

/// Like [`sanitize_text`] but `None` when empty after cleaning.
pub fn sanitize_opt(value: Option<&Value>, max_chars: usize) -> Option<String> {
    scalar_text(value).and_then(|raw| clean_str(&raw, max_chars))
}

pub fn clean_str(raw: &str, max_chars: usize) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .chars()
        .take(max_chars)
        .collect();
    let cleaned = cleaned.trim_end().to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

pub fn coerce_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
            })
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

pub fn coerce_i32(value: Option<&Value>) -> Option<i32> {
    coerce_i64(value).and_then(|v| i32::try_from(v).ok())
}

pub fn coerce_f64(value: Option<&Value>) -> Option<f64> {
    let f = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    f.is_finite().then_some(f)
}

pub fn coerce_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn is_genuine_steamid64(id: i64) -> bool {
    id > STEAMID64_BASE && id < RESERVED_BASE
}

/// A genuine steamid64 from a number or numeric string.
pub fn parse_steamid64(value: Option<&Value>) -> Option<i64> {
    let id = match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    is_genuine_steamid64(id).then_some(id)
}

/// `STEAM_X:Y:Z` → `BASE + 2Z + Y`.
pub fn steamid2_to_64(steam_id: &str) -> Option<i64> {
    let rest = steam_id.trim().strip_prefix("STEAM_")?;
    let mut parts = rest.split(':');
    let _universe: u8 = parts.next()?.parse().ok()?;
    let y: i64 = parts.next()?.parse().ok()?;
    let z: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(0..=1).contains(&y) || z < 0 {
        return None;
    }
    let id = STEAMID64_BASE.checked_add(z.checked_mul(2)?)?.checked_add(y)?;
    is_genuine_steamid64(id).then_some(id)
}

/// Natural key a synthetic player identity is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderSource {
    Record(i64),
    Ban(i64),
    Unknown,
}

/// Deterministic synthetic steamid64 for `source`; random only for `Unknown`.
pub fn placeholder_steamid64(source: PlaceholderSource) -> i64 {
    match source {
        PlaceholderSource::Record(id) if id > 0 => RESERVED_BASE + (id % PLACEHOLDER_SPAN),
        PlaceholderSource::Ban(id) if id > 0 => BAN_PLACEHOLDER_BASE + (id % PLACEHOLDER_SPAN),
        _ => rand::thread_rng().gen_range(RANDOM_PLACEHOLDER_BASE..RANDOM_PLACEHOLDER_END),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_control_chars_and_truncates() {
        let v = json!("  kz_\u{0000}grotto\u{0007}  ");
        assert_eq!(sanitize_text(Some(&v), 32, "unknown_map"), "kz_grotto");
        let long = json!("abcdefghij");
        assert_eq!(sanitize_text(Some(&long), 4, "x"), "abcd");
        assert_eq!(sanitize_text(Some(&json!("\u{0001}  ")), 8, "unknown"), "unknown");
        assert_eq!(sanitize_text(None, 8, "unknown"), "unknown");
        assert_eq!(sanitize_text(Some(&json!({"a": 1})), 8, "unknown"), "unknown");
    }

    #[test]
    fn coerces_loose_numbers() {
        assert_eq!(coerce_i64(Some(&json!("42"))), Some(42));
        assert_eq!(coerce_i64(Some(&json!(" 7.9 "))), Some(7));
        assert_eq!(coerce_i64(Some(&json!(3.2))), Some(3));
        assert_eq!(coerce_i64(Some(&json!("abc"))), None);
        assert_eq!(coerce_i32(Some(&json!(5_000_000_000i64))), None);
        assert_eq!(coerce_f64(Some(&json!("12.5"))), Some(12.5));
        assert_eq!(coerce_f64(Some(&json!("NaN"))), None);
        assert_eq!(coerce_bool(Some(&json!("yes"))), Some(true));
        assert_eq!(coerce_bool(Some(&json!(0))), Some(false));
    }

    #[test]
    fn validates_steamid64() {
        assert_eq!(
            parse_steamid64(Some(&json!("76561198000000001"))),
            Some(76_561_198_000_000_001)
        );
        assert_eq!(parse_steamid64(Some(&json!(12345))), None);
        assert_eq!(parse_steamid64(Some(&json!(RESERVED_BASE + 1))), None);
        assert_eq!(parse_steamid64(Some(&Value::Null)), None);
    }

    #[test]
    fn recovers_steamid2() {
        assert_eq!(
            steamid2_to_64("STEAM_1:1:12345"),
            Some(STEAMID64_BASE + 2 * 12345 + 1)
        );
        assert_eq!(steamid2_to_64("STEAM_0:2:1"), None);
        assert_eq!(steamid2_to_64("garbage"), None);
    }

    #[test]
    fn placeholders_are_deterministic_and_disjoint() {
        let a = placeholder_steamid64(PlaceholderSource::Record(42));
        assert_eq!(a, placeholder_steamid64(PlaceholderSource::Record(42)));
        assert_eq!(a, RESERVED_BASE + 42);
        let b = placeholder_steamid64(PlaceholderSource::Ban(42));
        assert_ne!(a, b);
        assert!(b >= RESERVED_BASE + (1 << 55));
        assert!(!is_genuine_steamid64(b));
        let r = placeholder_steamid64(PlaceholderSource::Unknown);
        assert!((RANDOM_PLACEHOLDER_BASE..RANDOM_PLACEHOLDER_END).contains(&r));
        assert!(!is_genuine_steamid64(r));
    }
}
