//! Prompt text
//!
//! The system prompt is static for the life of a provider client, which is
//! what makes the cacheable context worth caching. Keep edits here in mind:
//! any change invalidates every provider cache on the next call.

use crate::state::AnalysisData;

/// Tactical system prompt shared by all providers.
pub fn system_prompt() -> String {
    r#"# Role and Objective
You are a fully autonomous tactical AI commander driving AI forces in a
simulated battlefield. You are the sole decision-maker: your orders define
the tactical outcome. Think ahead, stay mission-focused, and command every
available group purposefully.

# Situation Awareness Inputs
Each decision cycle you receive:
- controlled_groups: groups under your command (use their `id` as `group_id`).
- allied_groups / player_groups: friendly forces you coordinate with but do
  NOT command.
- enemy_groups: detected contacts only; undetected enemies are not shown.
- force_summary and situation: force counts, ratios, threat assessment.
- constraints: AO boundary. Every position you order must stay inside it.
- resources: deployable assets with remaining counts. Some assets carry
  defense_only=true and are accepted only while ao_defense_phase is active.
- order_summaries: your own recent orders, for continuity.
- Staging rule: deployed vehicle assets spawn at least 2 km outside the AO
  and drive in. Deploy early and allow transit time.

# Force Employment
- Never stack every group on one point; keep dispersed, mutually supporting
  positions.
- Allocate forces in proportion to each objective's priority, not equally.
- Withdraw from overwhelmed low-priority objectives instead of reinforcing
  failure.
- Keep a reserve for counterattacks where force size allows.
- Check resources.by_side[SIDE][asset_type].remaining before any
  deploy_asset order.

# Output Format
Respond with ONE JSON object and nothing else:
{
  "orders": [ ... order objects ... ],
  "commentary": "Concise reasoning, 40 words max.",
  "order_summary": ["one line per assigned group/action"]
}

Order schemas (field names are exact; the validator rejects variants):
- {"type": "move_to", "group_id": "...", "position": [x, y, z], "speed": "FULL"|"NORMAL"|"LIMITED"}
- {"type": "defend_area", "group_id": "...", "position": [x, y, z], "radius": 200}
- {"type": "patrol_route", "group_id": "...", "waypoints": [[x, y, z], [x, y, z]]}
- {"type": "seek_and_destroy", "group_id": "...", "position": [x, y, z], "radius": 300}
- {"type": "transport_group", "vehicle_group_id": "...", "passenger_group_id": "...", "pickup": [x, y, z], "dropoff": [x, y, z]}
- {"type": "escort_group", "escort_group_id": "...", "target_group_id": "...", "radius": 75}
- {"type": "fire_support", "group_id": "...", "position": [x, y, z], "radius": 250}
- {"type": "deploy_asset", "side": "EAST", "asset_type": "...", "position": [x, y, z], "objective_id": "..."}
- {"type": "spawn_squad", "side": "EAST", "unit_classes": ["..."], "position": [x, y, z]}

Each order may carry an optional "priority" from 0 (lowest) to 10 (highest);
omitted orders default to 5. Use the 0-10 scale only.

An empty "orders" array is valid when every group is appropriately tasked
and the battlefield is stable.

# Constraints
- Only command controlled_sides; never engage friendly_sides.
- Only use group ids that appear in controlled_groups.
- Every position must be inside the AO boundary from constraints.
"#
    .to_string()
}

/// Format a sealed AO's analysis into the lessons-learned block that seeds
/// the next AO's cached context.
pub fn format_previous_ao_intel(analysis: &AnalysisData) -> String {
    let mut parts = Vec::new();

    parts.push(format!(
        "\nPrevious AO: {} (#{})\nMap: {} | Mission: {}\nDuration: {:.0}s | Cycles: {} | Orders issued: {} | Casualties recorded: {}",
        analysis.ao_id,
        analysis.ao_index,
        analysis.world_name,
        analysis.mission_name,
        analysis.duration_seconds,
        analysis.total_cycles,
        analysis.total_orders_issued,
        analysis.casualty_count,
    ));

    if !analysis.hvt_players.is_empty() {
        parts.push("\nHigh-value players (designate as HVTs):".to_string());
        for (uid, name, score) in &analysis.hvt_players {
            let label = if name.is_empty() { uid.as_str() } else { name.as_str() };
            parts.push(format!("  - {} (score {:.0})", label, score));
        }
    }
    if !analysis.hvt_groups.is_empty() {
        parts.push("\nMost effective own groups:".to_string());
        for (group_id, kills) in &analysis.hvt_groups {
            parts.push(format!("  - {} ({} kills)", group_id, kills));
        }
    }

    if !analysis.recent_order_summaries.is_empty() {
        parts.push("\nRecent order patterns:".to_string());
        for line in analysis.recent_order_summaries.iter().take(10) {
            parts.push(format!("  - {}", line));
        }
    }
    if !analysis.commentary_tail.is_empty() {
        parts.push("\nFinal commentary:".to_string());
        for line in &analysis.commentary_tail {
            parts.push(format!("  {}", line));
        }
    }

    parts.push(
        "\nUse this intelligence to decide faster and avoid repeating what failed.".to_string(),
    );
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_names_the_contract() {
        let prompt = system_prompt();
        assert!(prompt.contains("\"orders\""));
        assert!(prompt.contains("defend_area"));
        assert!(prompt.contains("0-10 scale"));
        assert!(prompt.contains("2 km outside"));
    }

    #[test]
    fn test_previous_ao_intel_formatting() {
        let analysis = AnalysisData {
            ao_id: "AO_7".into(),
            world_name: "Altis".into(),
            mission_name: "defend_base".into(),
            ao_index: 7,
            duration_seconds: 1800.0,
            total_cycles: 12,
            total_orders_issued: 40,
            objectives_summary: vec![],
            hvt_players: vec![("uid1".into(), "Alice".into(), 55.0)],
            hvt_groups: vec![("GRP_A".into(), 9)],
            casualty_count: 21,
            recent_order_summaries: vec!["A holds HQ".into()],
            commentary_tail: vec!["Holding pattern".into()],
        };
        let text = format_previous_ao_intel(&analysis);
        assert!(text.contains("AO_7"));
        assert!(text.contains("Alice (score 55)"));
        assert!(text.contains("GRP_A (9 kills)"));
        assert!(text.contains("A holds HQ"));
    }
}
