//! Order parser
//!
//! Turns an LLM reply into typed `Order` values. Tolerant where the model
//! is sloppy: fenced JSON, stray prose around the document, field aliases
//! (`group` for `group_id`, `location` for `position`), 2-D positions, and
//! numeric strings are all accepted. Each malformed order is dropped with a
//! recorded warning; a whole-document failure yields an empty order list
//! and a single error.

use crate::error::{EngineError, Result};
use crate::model::orders::{Order, OrderParams};
use crate::model::world::{Pos, Side};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Parsed reply document shape: `{"reasoning": ..., "orders": [...]}` plus
/// optional commentary and order-summary fields; extra fields are ignored.
#[derive(Debug, Clone, Default)]
pub struct ReplyDocument {
    pub commentary: String,
    pub orders: Vec<Value>,
    pub order_summary: Vec<String>,
}

fn fenced_json_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid regex"))
}

/// Pull the JSON object out of the reply text: fenced block first, then
/// outermost brace bounds.
fn extract_json(text: &str) -> Option<String> {
    if let Some(captures) = fenced_json_re().captures(text) {
        return Some(captures[1].to_string());
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| text[start..=end].to_string())
}

/// Parse the whole reply document.
pub fn parse_document(text: &str) -> Result<ReplyDocument> {
    let json_str = extract_json(text).ok_or_else(|| EngineError::ParseFailure {
        message: "no JSON object found in reply".into(),
    })?;
    let value: Value =
        serde_json::from_str(&json_str).map_err(|e| EngineError::ParseFailure {
            message: format!("reply JSON invalid: {}", e),
        })?;

    let orders = value
        .get("orders")
        .ok_or_else(|| EngineError::ParseFailure {
            message: "reply missing 'orders' field".into(),
        })?
        .as_array()
        .ok_or_else(|| EngineError::ParseFailure {
            message: "'orders' is not an array".into(),
        })?
        .clone();

    let commentary = value
        .get("commentary")
        .or_else(|| value.get("reasoning"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let order_summary = match value.get("order_summary") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        _ => Vec::new(),
    };

    Ok(ReplyDocument {
        commentary,
        orders,
        order_summary,
    })
}

fn num(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Coerce a position value: 2 or 3 coordinates, numbers or numeric strings.
fn coerce_position(v: Option<&Value>) -> std::result::Result<Pos, String> {
    let v = v.ok_or("missing position")?;
    let arr = v.as_array().ok_or("position is not an array")?;
    if arr.len() < 2 {
        return Err("position has fewer than 2 coordinates".into());
    }
    let mut pos = [0.0f64; 3];
    for (i, item) in arr.iter().take(3).enumerate() {
        pos[i] = num(item).ok_or("non-numeric position coordinate")?;
    }
    if pos.iter().any(|c| !c.is_finite()) {
        return Err("non-finite position coordinate".into());
    }
    Ok(pos)
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn opt_string(v: &Value, key: &str) -> Option<String> {
    str_field(v, key)
}

/// `group_id` with the `group` alias the model sometimes uses.
fn group_id_of(v: &Value) -> Option<String> {
    str_field(v, "group_id").or_else(|| str_field(v, "group"))
}

/// `position` with the `location` alias.
fn position_of(v: &Value) -> Option<&Value> {
    v.get("position").or_else(|| v.get("location"))
}

fn radius_of(v: &Value, default: f64) -> std::result::Result<f64, String> {
    match v.get("radius") {
        None | Some(Value::Null) => Ok(default),
        Some(raw) => {
            let r = num(raw).ok_or("radius is not a number")?;
            if r > 0.0 {
                Ok(r)
            } else {
                Err("radius must be positive".into())
            }
        }
    }
}

fn side_of(v: &Value) -> std::result::Result<Side, String> {
    let raw = str_field(v, "side").ok_or("missing side")?;
    Side::parse(&raw).ok_or_else(|| format!("invalid side '{}'", raw))
}

fn unit_classes_of(v: &Value) -> Vec<String> {
    v.get("unit_classes")
        .and_then(|u| u.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|c| c.as_str())
                .map(|c| c.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Parse one raw order value. Errors name the defect for the cycle record.
pub fn parse_order(v: &Value) -> std::result::Result<Order, String> {
    let obj = v.as_object().ok_or("order is not a map")?;
    let order_type = obj
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or("order missing 'type' field")?;

    let priority = v.get("priority").and_then(num);
    let objective_id = opt_string(v, "objective_id");

    let (group_id, params) = match order_type {
        "move_to" => {
            let group_id = group_id_of(v).ok_or("move_to missing group_id")?;
            let position = coerce_position(position_of(v))?;
            (
                group_id,
                OrderParams::MoveTo {
                    position,
                    speed: opt_string(v, "speed"),
                    formation: opt_string(v, "formation"),
                    behaviour: opt_string(v, "behaviour"),
                    combat_mode: opt_string(v, "combat_mode"),
                },
            )
        }
        "defend_area" => {
            let group_id = group_id_of(v).ok_or("defend_area missing group_id")?;
            let position = coerce_position(position_of(v))?;
            let radius = radius_of(v, 100.0)?;
            (group_id, OrderParams::DefendArea { position, radius })
        }
        "patrol_route" => {
            let group_id = group_id_of(v).ok_or("patrol_route missing group_id")?;
            let raw_waypoints = v
                .get("waypoints")
                .and_then(|w| w.as_array())
                .ok_or("patrol_route missing waypoints")?;
            if raw_waypoints.len() < 2 {
                return Err("patrol_route needs at least 2 waypoints".into());
            }
            let mut waypoints = Vec::with_capacity(raw_waypoints.len());
            for (i, wp) in raw_waypoints.iter().enumerate() {
                waypoints.push(
                    coerce_position(Some(wp))
                        .map_err(|e| format!("waypoint {}: {}", i, e))?,
                );
            }
            (
                group_id,
                OrderParams::PatrolRoute {
                    waypoints,
                    speed: opt_string(v, "speed"),
                    behaviour: opt_string(v, "behaviour"),
                },
            )
        }
        "seek_and_destroy" => {
            let group_id = group_id_of(v).ok_or("seek_and_destroy missing group_id")?;
            let position = coerce_position(position_of(v))?;
            let radius = radius_of(v, 200.0)?;
            (group_id, OrderParams::SeekAndDestroy { position, radius })
        }
        "transport_group" => {
            let group_id = str_field(v, "vehicle_group_id")
                .or_else(|| group_id_of(v))
                .ok_or("transport_group missing vehicle group id")?;
            let passenger_group_id =
                str_field(v, "passenger_group_id").ok_or("transport_group missing passenger_group_id")?;
            let pickup = coerce_position(v.get("pickup")).map_err(|e| format!("pickup: {}", e))?;
            let dropoff =
                coerce_position(v.get("dropoff")).map_err(|e| format!("dropoff: {}", e))?;
            (
                group_id,
                OrderParams::TransportGroup {
                    passenger_group_id,
                    pickup,
                    dropoff,
                },
            )
        }
        "escort_group" => {
            let group_id = str_field(v, "escort_group_id")
                .or_else(|| group_id_of(v))
                .ok_or("escort_group missing escort group id")?;
            let target_group_id =
                str_field(v, "target_group_id").ok_or("escort_group missing target_group_id")?;
            let radius = radius_of(v, 75.0)?;
            (
                group_id,
                OrderParams::EscortGroup {
                    target_group_id,
                    radius,
                },
            )
        }
        "fire_support" => {
            let group_id = group_id_of(v).ok_or("fire_support missing group_id")?;
            let position = coerce_position(position_of(v))?;
            let radius = radius_of(v, 250.0)?;
            (group_id, OrderParams::FireSupport { position, radius })
        }
        "deploy_asset" => {
            let side = side_of(v)?;
            let asset_type = str_field(v, "asset_type").ok_or("deploy_asset missing asset_type")?;
            let position = coerce_position(position_of(v))?;
            (
                String::new(),
                OrderParams::DeployAsset {
                    side,
                    asset_type,
                    unit_classes: unit_classes_of(v),
                    position,
                    objective_id: objective_id.clone(),
                },
            )
        }
        "spawn_squad" => {
            let side = side_of(v)?;
            let unit_classes = unit_classes_of(v);
            if unit_classes.is_empty() {
                return Err("spawn_squad has empty unit_classes".into());
            }
            let position = coerce_position(position_of(v))?;
            (
                String::new(),
                OrderParams::SpawnSquad {
                    side,
                    unit_classes,
                    position,
                    objective_id: objective_id.clone(),
                },
            )
        }
        other => return Err(format!("unknown order type '{}'", other)),
    };

    Ok(Order {
        group_id,
        params,
        priority,
        objective_id,
    })
}

/// Parse a batch of raw orders. Spawn orders go first so later orders may
/// reference the groups they create. Returns the accepted orders and one
/// warning per dropped order.
pub fn parse_orders(raw_orders: &[Value]) -> (Vec<Order>, Vec<String>) {
    let mut orders = Vec::with_capacity(raw_orders.len());
    let mut warnings = Vec::new();

    let is_spawn = |v: &Value| {
        matches!(
            v.get("type").and_then(|t| t.as_str()),
            Some("deploy_asset") | Some("spawn_squad")
        )
    };

    for pass_spawns in [true, false] {
        for (index, raw) in raw_orders.iter().enumerate() {
            if is_spawn(raw) != pass_spawns {
                continue;
            }
            match parse_order(raw) {
                Ok(order) => orders.push(order),
                Err(reason) => {
                    warnings.push(format!("order {} dropped: {}", index, reason));
                }
            }
        }
    }

    (orders, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_document_plain() {
        let doc = parse_document(
            r#"{"reasoning": "hold the line", "orders": [], "extra": 42}"#,
        )
        .unwrap();
        assert_eq!(doc.commentary, "hold the line");
        assert!(doc.orders.is_empty());
    }

    #[test]
    fn test_parse_document_fenced() {
        let text = "Here is my plan:\n```json\n{\"orders\": [{\"type\": \"move_to\"}], \"commentary\": \"go\"}\n```\nDone.";
        let doc = parse_document(text).unwrap();
        assert_eq!(doc.orders.len(), 1);
        assert_eq!(doc.commentary, "go");
    }

    #[test]
    fn test_parse_document_brace_bounded() {
        let text = "Sure! {\"orders\": [], \"order_summary\": [\"A holds HQ\"]} hope that helps";
        let doc = parse_document(text).unwrap();
        assert_eq!(doc.order_summary, vec!["A holds HQ"]);
    }

    #[test]
    fn test_parse_document_failures() {
        assert!(matches!(
            parse_document("no json here at all"),
            Err(EngineError::ParseFailure { .. })
        ));
        assert!(parse_document(r#"{"commentary": "missing orders"}"#).is_err());
        assert!(parse_document(r#"{"orders": "not an array"}"#).is_err());
    }

    #[test]
    fn test_parse_move_to_with_aliases() {
        let order = parse_order(&json!({
            "type": "move_to",
            "group": "GRP_EAST_1",
            "location": ["5100", "5200"],
            "speed": "FULL"
        }))
        .unwrap();
        assert_eq!(order.group_id, "GRP_EAST_1");
        match order.params {
            OrderParams::MoveTo {
                position, speed, ..
            } => {
                assert_eq!(position, [5100.0, 5200.0, 0.0]);
                assert_eq!(speed.as_deref(), Some("FULL"));
            }
            _ => panic!("wrong params variant"),
        }
    }

    #[test]
    fn test_patrol_route_requires_two_waypoints() {
        let err = parse_order(&json!({
            "type": "patrol_route",
            "group_id": "GRP_1",
            "waypoints": [[100, 100, 0]]
        }))
        .unwrap_err();
        assert!(err.contains("2 waypoints"));
    }

    #[test]
    fn test_spawn_squad_requires_unit_classes() {
        let err = parse_order(&json!({
            "type": "spawn_squad",
            "side": "EAST",
            "unit_classes": [],
            "position": [100, 100, 0]
        }))
        .unwrap_err();
        assert!(err.contains("unit_classes"));
    }

    #[test]
    fn test_invalid_radius_rejected() {
        let err = parse_order(&json!({
            "type": "defend_area",
            "group_id": "GRP_1",
            "position": [100, 100, 0],
            "radius": -50
        }))
        .unwrap_err();
        assert!(err.contains("radius"));
    }

    #[test]
    fn test_batch_spawns_parse_first_and_bad_orders_drop() {
        let raw = vec![
            json!({"type": "move_to", "group_id": "GRP_1", "position": [1, 2, 0]}),
            json!({"type": "deploy_asset", "side": "EAST", "asset_type": "infantry_squad",
                   "position": [3, 4, 0]}),
            json!("not even a map"),
            json!({"type": "teleport", "group_id": "GRP_1"}),
        ];
        let (orders, warnings) = parse_orders(&raw);
        assert_eq!(orders.len(), 2);
        // Spawn-type order is hoisted ahead of the move.
        assert_eq!(orders[0].command_type().as_str(), "deploy_asset");
        assert_eq!(orders[1].command_type().as_str(), "move_to");
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_serialize_parse_roundtrip() {
        let originals = vec![
            Order {
                group_id: "GRP_EAST_1".into(),
                params: OrderParams::DefendArea {
                    position: [5000.0, 5000.0, 0.0],
                    radius: 150.0,
                },
                priority: Some(9.0),
                objective_id: None,
            },
            Order {
                group_id: "GRP_EAST_2".into(),
                params: OrderParams::PatrolRoute {
                    waypoints: vec![[100.0, 100.0, 0.0], [200.0, 200.0, 0.0]],
                    speed: Some("LIMITED".into()),
                    behaviour: None,
                },
                priority: None,
                objective_id: None,
            },
            Order {
                group_id: String::new(),
                params: OrderParams::DeployAsset {
                    side: Side::East,
                    asset_type: "infantry_squad".into(),
                    unit_classes: vec!["O_Soldier_F".into()],
                    position: [4000.0, 4000.0, 0.0],
                    objective_id: Some("OBJ_HQ".into()),
                },
                priority: Some(7.0),
                objective_id: Some("OBJ_HQ".into()),
            },
            Order {
                group_id: "GRP_EAST_3".into(),
                params: OrderParams::TransportGroup {
                    passenger_group_id: "GRP_EAST_4".into(),
                    pickup: [1.0, 2.0, 0.0],
                    dropoff: [3.0, 4.0, 0.0],
                },
                priority: None,
                objective_id: None,
            },
        ];
        let raw: Vec<Value> = originals.iter().map(|o| o.to_value()).collect();
        let (parsed, warnings) = parse_orders(&raw);
        assert!(warnings.is_empty());
        // parse_orders hoists the spawn to the front; compare as sets.
        assert_eq!(parsed.len(), originals.len());
        for order in &originals {
            assert!(parsed.contains(order), "missing order: {:?}", order);
        }
    }
}
