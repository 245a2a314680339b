//! Zero-default coercions over dynamically typed record values.
//!
//! The graph driver returns heterogeneous values per field; all access
//! funnels through these helpers, which return the zero value on null or
//! type mismatch and never panic. A single bad field must not fail a whole
//! record.

use serde_json::Value;

pub fn as_str(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

/// Accepts integer and floating-point source forms; floats truncate.
pub fn as_i64(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                i
            } else if let Some(f) = n.as_f64() {
                f as i64
            } else {
                0
            }
        }
        _ => 0,
    }
}

pub fn as_f64(value: Option<&Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

pub fn as_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

/// Optional string: `None` for null/missing/empty.
pub fn as_opt_str(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

pub fn as_u32_list(value: Option<&Value>) -> Vec<u32> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_u64())
            .filter_map(|n| u32::try_from(n).ok())
            .collect(),
        _ => Vec::new(),
    }
}

pub fn as_str_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// A single hop along a returned path.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawHop {
    pub pk: String,
    pub code: String,
    pub status: String,
    pub device_type: String,
}

/// Parses a list-of-maps path projection defensively: malformed entries are
/// skipped, a hop without a pk is malformed.
pub fn parse_hops(value: Option<&Value>) -> Vec<RawHop> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let map = item.as_object()?;
            let pk = as_str(map.get("pk"));
            if pk.is_empty() {
                return None;
            }
            Some(RawHop {
                pk,
                code: as_str(map.get("code")),
                status: as_str(map.get("status")),
                device_type: as_str(map.get("device_type")),
            })
        })
        .collect()
}
