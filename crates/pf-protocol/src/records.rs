//! Helpers for the backend's loosely shaped collection responses

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Flatten a collection response into its records.
///
/// The backend answers list queries either with an object keyed by record
/// id or with a plain array.
pub fn collection_values(value: Value) -> Vec<Value> {
    match value {
        Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Render a JSON id (string or number) as a string
pub fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read the id a POST response carries under `key` (e.g. `jobId`)
pub fn created_id(body: &Value, key: &str) -> Option<String> {
    body.get(key).and_then(id_from_value)
}

/// Deserialize an optional record id that may be a string, a number or `false`
pub(crate) fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(id_from_value))
}
