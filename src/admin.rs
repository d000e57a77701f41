//! Admin command dispatch
//!
//! Routes `admin_command` names onto engine operations. Parameters arrive
//! as plain JSON (the bridge codec has already run); results are the
//! command-specific payload merged into the `{status: "ok"}` response by
//! the API layer.

use batcom_core::config::AssetSpec;
use batcom_core::{Engine, EngineError};
use serde_json::{json, Value};

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn violation(message: impl Into<String>) -> EngineError {
    EngineError::StateViolation {
        message: message.into(),
    }
}

/// Handle one admin command. Returns the command-specific payload.
pub fn handle(
    engine: &mut Engine,
    command: &str,
    params: &Value,
    flag: bool,
) -> std::result::Result<Value, EngineError> {
    batcom_core::info_log!("Admin command received: {}", command);
    match command {
        "commanderBrief" => {
            let intent = params
                .as_str()
                .or_else(|| params.get("intent").and_then(|v| v.as_str()))
                .filter(|s| !s.is_empty())
                .ok_or_else(|| violation("mission intent must be a non-empty string"))?;
            engine.commander_brief(intent.to_string(), flag);
            Ok(json!({"message": "Mission intent set"}))
        }

        "commanderAllies" => {
            let sides = string_list(params);
            engine.commander_allies(&sides)?;
            Ok(json!({"message": format!("Friendly sides set: {}", sides.join(", "))}))
        }

        "commanderSides" => {
            let sides = string_list(params);
            engine.commander_sides(&sides)?;
            Ok(json!({"message": format!("Controlled sides set: {}", sides.join(", "))}))
        }

        "commanderTask" => {
            let id = engine.commander_task(params)?;
            Ok(json!({"message": "Objective added", "objective_id": id}))
        }

        "deployCommander" => {
            engine.deploy_commander(flag)?;
            Ok(json!({
                "message": if flag { "Commander deployed - AI is now active" } else { "Commander undeployed" }
            }))
        }

        "commanderControlGroups" => {
            let ids = string_list(params);
            let count = ids.len();
            engine.control_groups(ids);
            Ok(json!({"message": format!("Control overrides updated ({} groups)", count)}))
        }

        "commanderGuardrails" => {
            engine.commander_guardrails(params)?;
            Ok(json!({"message": "Guardrails updated"}))
        }

        "setLLMConfig" => {
            engine.set_llm_config(params)?;
            Ok(json!({"message": "LLM config updated"}))
        }

        "setLLMApiKey" => {
            // Accepts {"provider": ..., "api_key": ...} or [provider, key].
            let (provider, key) = if let Some(obj) = params.as_object() {
                (
                    obj.get("provider").and_then(|v| v.as_str()).unwrap_or(""),
                    obj.get("api_key").and_then(|v| v.as_str()).unwrap_or(""),
                )
            } else if let Some(arr) = params.as_array() {
                (
                    arr.first().and_then(|v| v.as_str()).unwrap_or(""),
                    arr.get(1).and_then(|v| v.as_str()).unwrap_or(""),
                )
            } else {
                ("", "")
            };
            engine.set_llm_api_key(provider, key)?;
            Ok(json!({"message": format!("{} API key updated", provider)}))
        }

        "commanderStartAO" => {
            let (ao_id, world, mission) = if let Some(id) = params.as_str() {
                (id.to_string(), "unknown".to_string(), "unknown".to_string())
            } else {
                (
                    params
                        .get("ao_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    params
                        .get("world_name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                    params
                        .get("mission_name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                        .to_string(),
                )
            };
            if ao_id.is_empty() {
                return Err(violation("AO id must be a non-empty string"));
            }
            engine.start_ao(ao_id.clone(), world, mission)?;
            Ok(json!({"message": format!("AO tracking started: {}", ao_id)}))
        }

        "commanderEndAO" => {
            let analysis = engine.end_ao()?;
            Ok(json!({
                "message": format!("AO ended: {}", analysis.ao_id),
                "hvt_data": {
                    "players": analysis.hvt_players.iter()
                        .map(|(uid, name, score)| json!({"uid": uid, "name": name, "score": score}))
                        .collect::<Vec<_>>(),
                    "groups": analysis.hvt_groups.iter()
                        .map(|(id, kills)| json!({"group_id": id, "kills": kills}))
                        .collect::<Vec<_>>(),
                },
                "analysis": {
                    "duration_seconds": analysis.duration_seconds,
                    "total_cycles": analysis.total_cycles,
                    "total_orders_issued": analysis.total_orders_issued,
                    "casualty_count": analysis.casualty_count,
                },
            }))
        }

        "commanderSetHVT" => {
            let players = string_list(params.get("players").unwrap_or(&Value::Null));
            let groups = string_list(params.get("groups").unwrap_or(&Value::Null));
            let message = format!(
                "HVT designations updated: {} players, {} groups",
                players.len(),
                groups.len()
            );
            engine.set_hvt(players, groups);
            Ok(json!({"message": message}))
        }

        "aoProgress" => handle_ao_progress(engine, params),

        "resource_pool_add_asset" => {
            let arr = params
                .as_array()
                .ok_or_else(|| violation("expected [side, asset_type, max, classnames?, defense_only?, description?]"))?;
            let side = arr.first().and_then(|v| v.as_str()).unwrap_or("");
            let asset_type = arr.get(1).and_then(|v| v.as_str()).unwrap_or("");
            let max = arr.get(2).and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            let classnames = arr.get(3).map(string_list).unwrap_or_default();
            let defense_only = arr.get(4).and_then(|v| v.as_bool()).unwrap_or(false);
            let description = arr
                .get(5)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            engine.resource_pool_add_asset(
                side,
                asset_type,
                AssetSpec {
                    classnames,
                    max,
                    defense_only,
                    description,
                },
            )?;
            Ok(json!({"message": format!("Asset {} added to {}", asset_type, side)}))
        }

        "resource_pool_remove_asset" => {
            let arr = params
                .as_array()
                .ok_or_else(|| violation("expected [side, asset_type]"))?;
            let side = arr.first().and_then(|v| v.as_str()).unwrap_or("");
            let asset_type = arr.get(1).and_then(|v| v.as_str()).unwrap_or("");
            engine.resource_pool_remove_asset(side, asset_type)?;
            Ok(json!({"message": format!("Removed {} from {}", asset_type, side)}))
        }

        "resource_pool_clear_side" => {
            let side = params
                .as_str()
                .or_else(|| {
                    params
                        .as_array()
                        .and_then(|a| a.first())
                        .and_then(|v| v.as_str())
                })
                .unwrap_or("");
            engine.resource_pool_clear_side(side)?;
            Ok(json!({"message": format!("Cleared all resources for {}", side)}))
        }

        "load_resource_template" => {
            let name = params
                .as_str()
                .or_else(|| {
                    params
                        .as_array()
                        .and_then(|a| a.first())
                        .and_then(|v| v.as_str())
                })
                .unwrap_or("");
            let count = engine.load_resource_template(name)?;
            Ok(json!({
                "message": format!("Template '{}' loaded", name),
                "total_asset_types": count,
            }))
        }

        "list_resource_templates" => Ok(json!({"templates": engine.list_resource_templates()})),

        "set_ao_defense_phase" => {
            let active = params.as_bool().unwrap_or(flag);
            engine.set_ao_defense_phase(active);
            Ok(json!({
                "ao_defense_phase": active,
                "message": format!(
                    "Defense phase {} - defense_only assets are now {}",
                    if active { "activated" } else { "deactivated" },
                    if active { "available" } else { "restricted" }
                ),
            }))
        }

        "emergencyStop" => {
            engine.emergency_stop();
            Ok(json!({
                "message": "EMERGENCY STOP: all LLM operations halted, context cleared",
                "circuit_breaker_open": true,
                "note": "Use deployCommander to restart",
            }))
        }

        "getTokenStats" => Ok(json!({"stats": engine.token_stats()})),

        other => Err(violation(format!("Unknown command: {}", other))),
    }
}

fn handle_ao_progress(
    engine: &mut Engine,
    params: &Value,
) -> std::result::Result<Value, EngineError> {
    // List form: [eventType, playerUID, objectiveID?, objectiveType?,
    // completionMethod?, nearbyPlayers?]. Dict form uses named keys.
    let (event_type, player_uid, objective_id, objective_type, method, nearby_raw) =
        if let Some(arr) = params.as_array() {
            if arr.len() < 2 {
                return Err(violation(
                    "aoProgress expects [eventType, playerUID, ...]",
                ));
            }
            (
                arr[0].as_str().unwrap_or("").to_string(),
                arr[1].as_str().unwrap_or("").to_string(),
                arr.get(2).and_then(|v| v.as_str()).map(|s| s.to_string()),
                arr.get(3).and_then(|v| v.as_str()).map(|s| s.to_string()),
                arr.get(4).and_then(|v| v.as_str()).map(|s| s.to_string()),
                arr.get(5).cloned(),
            )
        } else if let Some(obj) = params.as_object() {
            (
                obj.get("event").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                obj.get("player").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                obj.get("objective").and_then(|v| v.as_str()).map(|s| s.to_string()),
                obj.get("type").and_then(|v| v.as_str()).map(|s| s.to_string()),
                obj.get("method").and_then(|v| v.as_str()).map(|s| s.to_string()),
                obj.get("nearby").cloned(),
            )
        } else {
            return Err(violation("aoProgress params must be a list or map"));
        };

    if event_type.is_empty() || player_uid.is_empty() {
        return Err(violation("aoProgress requires event type and player uid"));
    }

    // Nearby players arrive as [[uid, name, group_id], ...].
    let nearby: Vec<(String, String, String)> = nearby_raw
        .as_ref()
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let triple = item.as_array()?;
                    Some((
                        triple.first()?.as_str()?.to_string(),
                        triple.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        triple.get(2).and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    let points = engine.ao_progress(
        &event_type,
        &player_uid,
        objective_id.as_deref(),
        objective_type.as_deref(),
        method.as_deref(),
        &nearby,
    )?;

    let bonus = if nearby.is_empty() {
        String::new()
    } else {
        format!(" (+{} proximity bonuses)", nearby.len())
    };
    Ok(json!({
        "message": format!("Recorded {} by {} (+{:.0}){}", event_type, player_uid, points, bonus),
        "points": points,
    }))
}
