//! World snapshot normalizer
//!
//! `ingest` turns the raw payload from the bridge (already decoded from
//! pair-lists into a JSON tree) into a typed `Snapshot`. The function is
//! pure: on any shape mismatch it returns `BadSnapshot` and nothing is
//! applied. Numeric strings are coerced; side spellings go through the
//! normalization table; anything unrecognized is an error, not a guess.

use crate::error::{EngineError, Result};
use crate::model::world::{
    CasualtyEvent, Group, GroupBase, GroupClass, Objective, ObjectiveState, Player, Pos, Side,
    Snapshot, Waypoint,
};
use serde_json::Value;
use std::collections::HashMap;

fn bad(reason: impl Into<String>) -> EngineError {
    EngineError::BadSnapshot {
        reason: reason.into(),
    }
}

/// Numbers may arrive as strings over the bridge.
fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn field_f64(obj: &Value, key: &str) -> Result<f64> {
    obj.get(key)
        .and_then(as_f64)
        .ok_or_else(|| bad(format!("missing or non-numeric field '{}'", key)))
}

fn field_f64_or(obj: &Value, key: &str, default: f64) -> Result<f64> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => as_f64(v).ok_or_else(|| bad(format!("non-numeric field '{}'", key))),
    }
}

fn field_str(obj: &Value, key: &str) -> Result<String> {
    obj.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad(format!("missing string field '{}'", key)))
}

fn field_str_or(obj: &Value, key: &str, default: &str) -> String {
    obj.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or(default)
        .to_string()
}

fn field_bool_or(obj: &Value, key: &str, default: bool) -> bool {
    obj.get(key).and_then(as_bool).unwrap_or(default)
}

fn parse_side(raw: &str) -> Result<Side> {
    Side::parse(raw).ok_or_else(|| bad(format!("unknown side spelling '{}'", raw)))
}

fn parse_pos(v: &Value) -> Result<Pos> {
    let arr = v.as_array().ok_or_else(|| bad("position is not an array"))?;
    if arr.len() < 2 {
        return Err(bad("position has fewer than 2 coordinates"));
    }
    let mut coords = [0.0f64; 3];
    for (i, item) in arr.iter().take(3).enumerate() {
        coords[i] = as_f64(item).ok_or_else(|| bad("non-numeric position coordinate"))?;
    }
    Ok(coords)
}

fn parse_weather(v: Option<&Value>) -> Result<[f64; 4]> {
    let mut weather = [0.0f64; 4];
    let Some(arr) = v.and_then(|v| v.as_array()) else {
        return Ok(weather);
    };
    for (i, item) in arr.iter().take(4).enumerate() {
        // Wind may arrive as a [direction, speed] pair; keep the speed.
        weather[i] = match item {
            Value::Array(inner) => inner.last().and_then(as_f64).unwrap_or(0.0),
            other => as_f64(other).ok_or_else(|| bad("non-numeric weather component"))?,
        };
    }
    Ok(weather)
}

fn parse_group(v: &Value) -> Result<Group> {
    let base = GroupBase {
        id: field_str(v, "id")?,
        side: parse_side(&field_str(v, "side")?)?,
        class: GroupClass::parse(&field_str_or(v, "type", "unknown")),
        position: parse_pos(v.get("position").ok_or_else(|| bad("group missing position"))?)?,
        unit_count: field_f64(v, "unit_count")? as u32,
        behaviour: field_str_or(v, "behaviour", "AWARE"),
        combat_mode: field_str_or(v, "combat_mode", "YELLOW"),
        formation: field_str_or(v, "formation", "WEDGE"),
        in_combat: field_bool_or(v, "in_combat", false),
        waypoint: {
            let kind = field_str_or(v, "current_waypoint_type", "");
            if kind.is_empty() {
                None
            } else {
                let pos = v
                    .get("current_waypoint_pos")
                    .map(parse_pos)
                    .transpose()?
                    .unwrap_or([0.0, 0.0, 0.0]);
                Some(Waypoint { kind, position: pos })
            }
        },
    };

    if field_bool_or(v, "is_controlled", false) {
        Ok(Group::Controlled {
            base,
            casualties: field_f64_or(v, "casualties", 0.0)? as u32,
            speed_mode: field_str_or(v, "speed_mode", "NORMAL"),
        })
    } else {
        Ok(Group::Observed {
            base,
            is_friendly: field_bool_or(v, "is_friendly", false),
            knowledge: field_f64_or(v, "knowledge", 0.0)?,
        })
    }
}

fn parse_player(v: &Value) -> Result<Player> {
    Ok(Player {
        name: field_str(v, "name")?,
        uid: field_str(v, "uid")?,
        side: parse_side(&field_str(v, "side")?)?,
        group_id: field_str_or(v, "group_id", ""),
        position: parse_pos(v.get("position").ok_or_else(|| bad("player missing position"))?)?,
        is_in_vehicle: field_bool_or(v, "is_in_vehicle", false),
        damage: field_f64_or(v, "damage", 0.0)?,
        is_hvt: field_bool_or(v, "is_hvt", false),
    })
}

fn parse_objective_state(raw: &str) -> Result<ObjectiveState> {
    match raw.to_ascii_lowercase().as_str() {
        "" | "active" | "pending" => Ok(ObjectiveState::Active),
        "captured" => Ok(ObjectiveState::Captured),
        "destroyed" => Ok(ObjectiveState::Destroyed),
        "completed" => Ok(ObjectiveState::Completed),
        "failed" => Ok(ObjectiveState::Failed),
        other => Err(bad(format!("unknown objective state '{}'", other))),
    }
}

fn parse_objective(v: &Value) -> Result<Objective> {
    let metadata = v
        .get("metadata")
        .and_then(|m| m.as_object())
        .map(|m| m.iter().map(|(k, val)| (k.clone(), val.clone())).collect())
        .unwrap_or_default();
    Ok(Objective {
        id: field_str(v, "id")?,
        description: field_str_or(v, "description", &field_str_or(v, "text", "")),
        priority: field_f64_or(v, "priority", 50.0)?,
        position: parse_pos(
            v.get("position")
                .ok_or_else(|| bad("objective missing position"))?,
        )?,
        radius: field_f64_or(v, "radius", 200.0)?,
        task_type: field_str_or(v, "task_type", &field_str_or(v, "type", "")),
        state: parse_objective_state(&field_str_or(v, "state", "active"))?,
        metadata,
    })
}

fn parse_casualty(v: &Value) -> Result<CasualtyEvent> {
    Ok(CasualtyEvent {
        victim_id: field_str(v, "victim_id")?,
        victim_side: parse_side(&field_str(v, "victim_side")?)?,
        killer_id: v
            .get("killer_id")
            .and_then(|k| k.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
        killer_side: match v.get("killer_side").and_then(|k| k.as_str()) {
            Some(s) if !s.is_empty() => Some(parse_side(s)?),
            _ => None,
        },
        timestamp: field_f64_or(v, "timestamp", 0.0)?,
        position: v.get("position").map(parse_pos).transpose().ok().flatten(),
        weapon: field_str_or(v, "weapon", ""),
        objective_id: v
            .get("objective_id")
            .and_then(|k| k.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string()),
    })
}

fn parse_sides(v: Option<&Value>) -> Result<Vec<Side>> {
    let Some(arr) = v.and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };
    let mut sides = Vec::with_capacity(arr.len());
    for item in arr {
        let raw = item.as_str().ok_or_else(|| bad("side entry is not a string"))?;
        let side = parse_side(raw)?;
        if !sides.contains(&side) {
            sides.push(side);
        }
    }
    Ok(sides)
}

/// Normalize a raw snapshot payload into a typed `Snapshot`.
pub fn ingest(raw: &Value) -> Result<Snapshot> {
    let obj = raw
        .as_object()
        .ok_or_else(|| bad("snapshot payload is not a map"))?;

    let mut groups = Vec::new();
    if let Some(items) = obj.get("groups").and_then(|v| v.as_array()) {
        for item in items {
            groups.push(parse_group(item)?);
        }
    }

    let mut players = Vec::new();
    if let Some(items) = obj.get("players").and_then(|v| v.as_array()) {
        for item in items {
            players.push(parse_player(item)?);
        }
    }

    let mut objectives = Vec::new();
    if let Some(items) = obj.get("objectives").and_then(|v| v.as_array()) {
        for item in items {
            objectives.push(parse_objective(item)?);
        }
    }

    let mut casualty_events = Vec::new();
    if let Some(items) = obj.get("casualty_events").and_then(|v| v.as_array()) {
        for item in items {
            casualty_events.push(parse_casualty(item)?);
        }
    }

    let mut ai_deployment = HashMap::new();
    if let Some(map) = obj.get("ai_deployment").and_then(|v| v.as_object()) {
        for (raw_side, count) in map {
            let side = parse_side(raw_side)?;
            let n = as_f64(count).ok_or_else(|| bad("non-numeric deployment count"))? as u32;
            ai_deployment.insert(side, n);
        }
    }

    let mut contributions = HashMap::new();
    if let Some(map) = obj.get("contributions").and_then(|v| v.as_object()) {
        for (uid, count) in map {
            let n = as_f64(count).ok_or_else(|| bad("non-numeric contribution count"))? as u32;
            contributions.insert(uid.clone(), n);
        }
    }

    let mission_variables = obj
        .get("mission_variables")
        .and_then(|m| m.as_object())
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    Ok(Snapshot {
        mission_time: field_f64_or(raw, "mission_time", 0.0)?,
        daytime: field_f64_or(raw, "daytime", 0.5)?,
        weather: parse_weather(obj.get("weather"))?,
        world_name: field_str_or(raw, "world_name", "unknown"),
        mission_name: field_str_or(raw, "mission_name", "unknown"),
        ai_deployment,
        groups,
        players,
        objectives,
        mission_variables,
        mission_intent: field_str_or(raw, "mission_intent", ""),
        friendly_sides: parse_sides(obj.get("friendly_sides"))?,
        controlled_sides: parse_sides(obj.get("controlled_sides"))?,
        casualty_events,
        contributions,
    })
}
