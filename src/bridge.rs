//! Bridge value codec
//!
//! The host bridge cannot carry maps: payloads arrive as ordered lists of
//! `[key, value]` pairs and responses must go back the same way. This
//! module converts between that shape and plain JSON objects at the
//! boundary, so nothing past this file ever sees a pair list.

use serde_json::{Map, Value};

/// Does this array look like a pair list (`[["k", v], ...]`)?
fn is_pair_list(items: &[Value]) -> bool {
    !items.is_empty()
        && items.iter().all(|item| {
            item.as_array()
                .map(|pair| pair.len() == 2 && pair[0].is_string())
                .unwrap_or(false)
        })
}

/// Convert a bridge tree into plain JSON: pair lists become objects,
/// everything else recurses unchanged.
pub fn pairs_to_value(value: &Value) -> Value {
    match value {
        Value::Array(items) if is_pair_list(items) => {
            let mut map = Map::new();
            for pair in items {
                let pair = pair.as_array().expect("checked by is_pair_list");
                let key = pair[0].as_str().expect("checked by is_pair_list");
                map.insert(key.to_string(), pairs_to_value(&pair[1]));
            }
            Value::Object(map)
        }
        Value::Array(items) => Value::Array(items.iter().map(pairs_to_value).collect()),
        other => other.clone(),
    }
}

/// Convert plain JSON into the bridge shape: objects become pair lists and
/// nulls become empty strings (the host side cannot represent nil).
pub fn value_to_pairs(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Array(
            map.iter()
                .map(|(key, v)| Value::Array(vec![Value::String(key.clone()), value_to_pairs(v)]))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(value_to_pairs).collect()),
        Value::Null => Value::String(String::new()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pairs_to_value_nested() {
        let pairs = json!([
            ["mission_time", 125.5],
            ["ai", [["enabled", true], ["model", "gemini-2.0-flash-001"]]],
            ["groups", [[["id", "GRP_1"], ["side", "EAST"]]]]
        ]);
        let value = pairs_to_value(&pairs);
        assert_eq!(value["mission_time"], 125.5);
        assert_eq!(value["ai"]["model"], "gemini-2.0-flash-001");
        assert_eq!(value["groups"][0]["id"], "GRP_1");
    }

    #[test]
    fn test_plain_arrays_stay_arrays() {
        let position = json!([5000.0, 5000.0, 0.0]);
        assert_eq!(pairs_to_value(&position), position);
        // A mixed array is not a pair list.
        let mixed = json!([["key", 1], "stray"]);
        assert_eq!(pairs_to_value(&mixed), mixed);
    }

    #[test]
    fn test_value_to_pairs_replaces_null() {
        let value = json!({"status": "ok", "error": null});
        let pairs = value_to_pairs(&value);
        let items = pairs.as_array().unwrap();
        assert!(items.contains(&json!(["error", ""])));
        assert!(items.contains(&json!(["status", "ok"])));
    }

    #[test]
    fn test_round_trip() {
        let original = json!({
            "status": "ok",
            "commands": [{"type": "move_to", "priority": 9}],
            "nested": {"a": [1, 2, 3]}
        });
        let round_tripped = pairs_to_value(&value_to_pairs(&original));
        assert_eq!(round_tripped, original);
    }
}
