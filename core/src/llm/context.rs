//! Decision context assembly
//!
//! The context sent to a provider is split in two: a cacheable part
//! (system prompt, previous-AO intelligence, objectives) that changes
//! rarely, and a dynamic part (world state, mission intent, recent order
//! summaries) that changes every cycle. Providers cache the former.

use crate::decision::evaluator::ObjectiveEval;
use crate::model::world::{dist_2d, Group, Side, Snapshot};
use serde_json::{json, Value};

/// Context for one provider call.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub system_prompt: String,
    pub objectives: Vec<ObjectiveEval>,
    /// Formatted lessons-learned block from the last sealed AO; present only
    /// on the first cycles of a new AO.
    pub previous_ao_intel: Option<String>,
    /// Dynamic world-state document
    pub world: Value,
    pub mission_intent: String,
    pub mission_time: f64,
}

impl DecisionContext {
    /// The slow-changing part a provider may cache.
    pub fn cacheable_text(&self) -> String {
        let mut parts = vec![self.system_prompt.clone()];

        if let Some(intel) = &self.previous_ao_intel {
            parts.push(format!(
                "\n{}\n**INTELLIGENCE FROM PREVIOUS AO (LESSONS LEARNED)**\n{}\n{}",
                "=".repeat(80),
                "=".repeat(80),
                intel
            ));
        }

        parts.push(format!(
            "\n{}\n**CURRENT MISSION OBJECTIVES**\n{}",
            "=".repeat(80),
            "=".repeat(80)
        ));
        if self.objectives.is_empty() {
            parts.push("\nNo active objectives currently.".to_string());
        }
        for eval in &self.objectives {
            let obj = &eval.objective;
            let mut block = format!(
                "\n\nObjective: {}\n  Description: {}\n  Priority: {:.0} ({})\n  State: {}\n  Position: [{:.0}, {:.0}]\n  Radius: {:.0}m",
                obj.id,
                obj.description,
                eval.dynamic_priority,
                eval.state.as_str(),
                obj.state.as_str(),
                obj.position[0],
                obj.position[1],
                obj.radius,
            );
            if !obj.task_type.is_empty() {
                block.push_str(&format!("\n  Task: {}", obj.task_type));
            }
            if !obj.metadata.is_empty() {
                block.push_str(&format!(
                    "\n  Metadata: {}",
                    serde_json::to_string(&obj.metadata).unwrap_or_default()
                ));
            }
            parts.push(block);
        }

        parts.join("")
    }

    /// The per-cycle part, sent fresh every call.
    pub fn dynamic_text(&self) -> String {
        format!(
            "**CURRENT SITUATION (T+{:.0}s)**\n\nMISSION INTENT: {}\n\nWORLD STATE:\n{}",
            self.mission_time,
            if self.mission_intent.is_empty() {
                "N/A"
            } else {
                &self.mission_intent
            },
            serde_json::to_string_pretty(&self.world).unwrap_or_default()
        )
    }
}

/// Battlefield situation assessment for the dynamic context.
#[derive(Debug, Clone, PartialEq)]
pub struct Situation {
    pub threat_level: &'static str,
    pub recommended_posture: &'static str,
    pub enemy_activity: String,
    pub objectives_under_threat: Vec<String>,
}

pub fn assess_situation(snapshot: &Snapshot, evals: &[ObjectiveEval]) -> Situation {
    let enemy_groups: Vec<&Group> = snapshot.enemy_groups().collect();
    if enemy_groups.is_empty() {
        return Situation {
            threat_level: "MINIMAL",
            recommended_posture: "OFFENSIVE",
            enemy_activity: "No known enemies detected".to_string(),
            objectives_under_threat: Vec::new(),
        };
    }

    let enemy_units: u32 = enemy_groups.iter().map(|g| g.unit_count()).sum();
    let friendly_units: u32 = snapshot
        .groups
        .iter()
        .filter(|g| g.is_controlled() || g.is_friendly())
        .map(|g| g.unit_count())
        .sum();

    let mut under_threat: Vec<String> = Vec::new();
    let mut critical_threatened = false;
    let mut enemy_near_objectives = 0u32;
    for eval in evals {
        let obj = &eval.objective;
        let nearby: u32 = enemy_groups
            .iter()
            .filter(|g| dist_2d(g.position(), &obj.position) < obj.radius * 2.0)
            .map(|g| g.unit_count())
            .sum();
        if nearby > 0 {
            enemy_near_objectives += nearby;
            under_threat.push(obj.id.clone());
            if eval.dynamic_priority >= 90.0 || (obj.priority <= 10.0 && obj.priority >= 9.0) {
                critical_threatened = true;
            }
        }
    }

    let (threat_level, recommended_posture) = if critical_threatened {
        ("CRITICAL", "DEFEND_CRITICAL_OBJECTIVES_MAINTAIN_AO_CONTROL")
    } else if enemy_units > friendly_units * 2 && enemy_near_objectives > 0 {
        ("CRITICAL", "PRIORITIZE_HIGH_VALUE_OBJECTIVES")
    } else if enemy_units > friendly_units && enemy_near_objectives > 0 {
        ("HIGH", "DEFEND_BY_PRIORITY_SACRIFICE_LOWEST")
    } else if !under_threat.is_empty() {
        ("MODERATE", "DEFEND_THREATENED_OBJECTIVES")
    } else {
        ("LOW", "PROPORTIONAL_RESPONSE")
    };

    let enemy_activity = if under_threat.is_empty() {
        format!(
            "{} enemy groups detected - all distant from objectives",
            enemy_groups.len()
        )
    } else {
        format!(
            "{} enemy groups detected - {} objective(s) under threat: {}",
            enemy_groups.len(),
            under_threat.len(),
            under_threat.join(", ")
        )
    };

    Situation {
        threat_level,
        recommended_posture,
        enemy_activity,
        objectives_under_threat: under_threat,
    }
}

fn group_value(group: &Group, evals: &[ObjectiveEval], detailed: bool) -> Value {
    let base = group.base();
    let mut v = json!({
        "id": base.id,
        "type": base.class.as_str(),
        "side": base.side.as_str(),
        "position": [base.position[0].round(), base.position[1].round()],
        "unit_count": base.unit_count,
        "is_vehicle": base.class.can_transport(),
        "in_combat": base.in_combat,
    });
    let obj = v.as_object_mut().expect("group value is a map");

    // Top 3 closest objectives give the model spatial anchoring.
    let mut distances: Vec<(String, f64)> = evals
        .iter()
        .map(|e| {
            (
                e.objective.id.clone(),
                dist_2d(&base.position, &e.objective.position),
            )
        })
        .collect();
    distances.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    if !distances.is_empty() {
        obj.insert(
            "nearest_objectives".into(),
            Value::Array(
                distances
                    .iter()
                    .take(3)
                    .map(|(id, d)| json!({"objective_id": id, "distance_m": d.round()}))
                    .collect(),
            ),
        );
    }

    match group {
        Group::Controlled {
            base,
            casualties,
            speed_mode,
        } if detailed => {
            obj.insert("behaviour".into(), json!(base.behaviour));
            obj.insert("combat_mode".into(), json!(base.combat_mode));
            obj.insert("formation".into(), json!(base.formation));
            obj.insert("speed_mode".into(), json!(speed_mode));
            obj.insert("casualties".into(), json!(casualties));
            if let Some(wp) = &base.waypoint {
                obj.insert(
                    "current_order".into(),
                    json!({
                        "type": wp.kind,
                        "position": [wp.position[0].round(), wp.position[1].round()],
                    }),
                );
            }
        }
        Group::Observed { knowledge, .. } => {
            obj.insert("knowledge".into(), json!(knowledge));
        }
        _ => {}
    }
    v
}

/// Build the dynamic world-state document for one cycle.
#[allow(clippy::too_many_arguments)]
pub fn build_world_value(
    snapshot: &Snapshot,
    evals: &[ObjectiveEval],
    controlled_sides: &[Side],
    friendly_sides: &[Side],
    constraints: Option<Value>,
    resources: Option<Value>,
    ao_defense_phase: bool,
    order_summaries: &[Value],
) -> Value {
    let controlled: Vec<&Group> = snapshot
        .groups
        .iter()
        .filter(|g| g.is_controlled())
        .collect();
    let allied: Vec<&Group> = snapshot
        .groups
        .iter()
        .filter(|g| !g.is_controlled() && g.is_friendly())
        .collect();
    let enemies: Vec<&Group> = snapshot
        .groups
        .iter()
        .filter(|g| {
            !g.is_controlled()
                && !friendly_sides.contains(&g.side())
                && !controlled_sides.contains(&g.side())
        })
        .collect();

    let controlled_units: u32 = controlled.iter().map(|g| g.unit_count()).sum();
    let allied_units: u32 = allied.iter().map(|g| g.unit_count()).sum();
    let enemy_units: u32 = enemies.iter().map(|g| g.unit_count()).sum();
    let friendly_units = controlled_units + allied_units;
    let force_ratio = if enemy_units > 0 {
        (friendly_units as f64 / enemy_units as f64 * 100.0).round() / 100.0
    } else {
        999.0
    };

    let situation = assess_situation(snapshot, evals);

    let mut world = json!({
        "mission_time": snapshot.mission_time.round(),
        "time_of_day": if snapshot.is_night() { "NIGHT" } else { "DAY" },
        "force_summary": {
            "controlled_groups": controlled.len(),
            "controlled_units": controlled_units,
            "allied_groups": allied.len(),
            "allied_units": allied_units,
            "total_friendly_units": friendly_units,
            "enemy_groups": enemies.len(),
            "enemy_units": enemy_units,
            "force_ratio": force_ratio,
        },
        "controlled_groups": controlled.iter().map(|g| group_value(g, evals, true)).collect::<Vec<_>>(),
        "allied_groups": allied.iter().map(|g| group_value(g, evals, true)).collect::<Vec<_>>(),
        // Only detected contacts; cap keeps the prompt bounded.
        "enemy_groups": enemies.iter().take(30).map(|g| group_value(g, evals, false)).collect::<Vec<_>>(),
        "situation": {
            "threat_level": situation.threat_level,
            "recommended_posture": situation.recommended_posture,
            "enemy_activity": situation.enemy_activity,
            "objectives_under_threat": situation.objectives_under_threat,
        },
        "controlled_sides": controlled_sides.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
        "friendly_sides": friendly_sides.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
    });
    let map = world.as_object_mut().expect("world value is a map");

    if !snapshot.mission_variables.is_empty() {
        map.insert(
            "mission_variables".into(),
            json!(snapshot.mission_variables),
        );
    }
    if let Some(constraints) = constraints {
        map.insert("constraints".into(), constraints);
    }
    if let Some(resources) = resources {
        map.insert("resources".into(), resources);
        if ao_defense_phase {
            map.insert(
                "ao_defense_phase".into(),
                json!({
                    "active": true,
                    "description": "AO is under counterattack - all defense_only assets are available",
                }),
            );
        }
        // Nudge the model toward the pool when outnumbered.
        if !enemies.is_empty() && force_ratio < 1.5 {
            map.insert(
                "deployment_directive".into(),
                json!({
                    "must_deploy_now": true,
                    "force_ratio": force_ratio,
                    "enemy_groups_detected": enemies.len(),
                }),
            );
        }
    }
    if !order_summaries.is_empty() {
        map.insert("order_summaries".into(), json!(order_summaries));
    }

    world
}
