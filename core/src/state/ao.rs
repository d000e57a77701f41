//! AO records and post-AO analysis
//!
//! One `AoRecord` accumulates everything that happened during a mission
//! instance: decision cycles, casualty events, per-player contribution
//! tallies, and capture events from the host. Sealing the record computes
//! HVT designations for the next AO.

use crate::model::world::CasualtyEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Points for host-reported capture events. Capturing alive outranks
/// killing for the same target class.
pub fn event_points(event_type: &str) -> f64 {
    let normalized = event_type
        .trim()
        .to_ascii_lowercase()
        .replace(['-', ' '], "_");
    match normalized.as_str() {
        "commander_captured" | "commandercaptured" => 40.0,
        "commander_killed" | "commanderkilled" => 30.0,
        "hvt_captured" | "hvtcaptured" => 35.0,
        "hvt_killed" | "hvt_eliminated" | "hvteliminated" => 25.0,
        "radio_tower_destroyed"
        | "radiotowerdestroyed"
        | "radio_tower_neutralized"
        | "radiotowerneutralized"
        | "gps_jammer_destroyed"
        | "gpsjammerdestroyed"
        | "gps_jammer_disabled"
        | "gpsjammerdisabled" => 20.0,
        "supply_depot_captured" | "supplydepotcaptured" => 15.0,
        _ => 5.0,
    }
}

/// Bonus for players near the objective when someone else completes it.
pub const PROXIMITY_BONUS: f64 = 10.0;

/// Weights for the composite HVT score, plus designation set sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HvtConfig {
    pub w_kills: f64,
    pub w_contributions: f64,
    pub w_proximity: f64,
    pub w_captures: f64,
    pub top_players: usize,
    pub top_groups: usize,
    /// Meters around an active objective that count as "at" it; capped 100.
    pub proximity_radius: f64,
}

impl Default for HvtConfig {
    fn default() -> Self {
        Self {
            w_kills: 1.0,
            w_contributions: 5.0,
            w_proximity: 0.1,
            w_captures: 1.0,
            top_players: 2,
            top_groups: 2,
            proximity_radius: 100.0,
        }
    }
}

/// One player's running tallies for the current AO.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerTally {
    pub name: String,
    pub group_id: String,
    pub kills: u32,
    pub objective_contributions: u32,
    /// Seconds spent within proximity radius of an active objective
    pub proximity_time: f64,
    pub capture_points: f64,
}

impl PlayerTally {
    pub fn composite_score(&self, weights: &HvtConfig) -> f64 {
        weights.w_kills * self.kills as f64
            + weights.w_contributions * self.objective_contributions as f64
            + weights.w_proximity * self.proximity_time
            + weights.w_captures * self.capture_points
    }
}

/// One rejected order and why.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedOrder {
    pub order: Value,
    pub reason: String,
}

/// One decision cycle as recorded in the AO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle: u64,
    pub mission_time: f64,
    pub wall_time: DateTime<Utc>,
    /// Accepted order documents
    pub orders: Vec<Value>,
    pub rejected: Vec<RejectedOrder>,
    pub commentary: String,
    pub order_summary: Vec<String>,
    /// Active objectives at decision time
    pub objectives: Vec<Value>,
    pub threat_level: String,
    /// Set when the cycle produced no orders because of a failure
    pub failure_note: Option<String>,
}

/// The full per-AO record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AoRecord {
    pub ao_id: String,
    pub world_name: String,
    pub mission_name: String,
    pub ao_index: u32,
    pub started_at: DateTime<Utc>,
    pub cycles: Vec<CycleRecord>,
    pub casualties: Vec<CasualtyEvent>,
    pub players: HashMap<String, PlayerTally>,
    /// Controlled group id -> kills credited to it
    pub group_kills: HashMap<String, u32>,
}

impl AoRecord {
    pub fn new(ao_id: String, world_name: String, mission_name: String, ao_index: u32) -> Self {
        Self {
            ao_id,
            world_name,
            mission_name,
            ao_index,
            started_at: Utc::now(),
            cycles: Vec::new(),
            casualties: Vec::new(),
            players: HashMap::new(),
            group_kills: HashMap::new(),
        }
    }

    pub fn total_orders(&self) -> usize {
        self.cycles.iter().map(|c| c.orders.len()).sum()
    }

    pub fn player(&mut self, uid: &str) -> &mut PlayerTally {
        self.players.entry(uid.to_string()).or_default()
    }
}

/// Sealed-AO analysis returned to the host and retained for the next AO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisData {
    pub ao_id: String,
    pub world_name: String,
    pub mission_name: String,
    pub ao_index: u32,
    pub duration_seconds: f64,
    pub total_cycles: usize,
    pub total_orders_issued: usize,
    pub objectives_summary: Vec<Value>,
    /// (uid, name, composite score), highest first, top-N
    pub hvt_players: Vec<(String, String, f64)>,
    /// (group id, kills), highest first, top-M
    pub hvt_groups: Vec<(String, u32)>,
    pub casualty_count: usize,
    /// Last few order summaries, for the next AO's cached intel block
    pub recent_order_summaries: Vec<String>,
    pub commentary_tail: Vec<String>,
}

/// Seal a record: HVT designation plus roll-ups.
pub fn analyze(record: &AoRecord, weights: &HvtConfig) -> AnalysisData {
    let mut scored: Vec<(String, String, f64)> = record
        .players
        .iter()
        .map(|(uid, tally)| (uid.clone(), tally.name.clone(), tally.composite_score(weights)))
        .filter(|(_, _, score)| *score > 0.0)
        .collect();
    scored.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(weights.top_players);

    let mut groups: Vec<(String, u32)> = record
        .group_kills
        .iter()
        .map(|(id, kills)| (id.clone(), *kills))
        .filter(|(_, kills)| *kills > 0)
        .collect();
    groups.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    groups.truncate(weights.top_groups);

    let objectives_summary = record
        .cycles
        .last()
        .map(|c| c.objectives.clone())
        .unwrap_or_default();

    let recent_order_summaries = record
        .cycles
        .iter()
        .rev()
        .take(5)
        .flat_map(|c| c.order_summary.iter().cloned())
        .collect();

    let commentary_tail = record
        .cycles
        .iter()
        .rev()
        .take(3)
        .map(|c| c.commentary.clone())
        .filter(|c| !c.is_empty())
        .collect();

    AnalysisData {
        ao_id: record.ao_id.clone(),
        world_name: record.world_name.clone(),
        mission_name: record.mission_name.clone(),
        ao_index: record.ao_index,
        duration_seconds: (Utc::now() - record.started_at).num_milliseconds() as f64 / 1000.0,
        total_cycles: record.cycles.len(),
        total_orders_issued: record.total_orders(),
        objectives_summary,
        hvt_players: scored,
        hvt_groups: groups,
        casualty_count: record.casualties.len(),
        recent_order_summaries,
        commentary_tail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_points_table() {
        assert_eq!(event_points("commanderCaptured"), 40.0);
        assert_eq!(event_points("commander_killed"), 30.0);
        assert_eq!(event_points("hvtCaptured"), 35.0);
        assert_eq!(event_points("hvt_killed"), 25.0);
        assert_eq!(event_points("radioTowerDestroyed"), 20.0);
        assert_eq!(event_points("gps_jammer_disabled"), 20.0);
        assert_eq!(event_points("supplyDepotCaptured"), 15.0);
        assert_eq!(event_points("mortar_pit_neutralized"), 5.0);
    }

    #[test]
    fn test_composite_score_weighting() {
        let weights = HvtConfig::default();
        let tally = PlayerTally {
            kills: 4,
            objective_contributions: 2,
            proximity_time: 30.0,
            capture_points: 40.0,
            ..Default::default()
        };
        // 4*1 + 2*5 + 30*0.1 + 40*1 = 57
        assert!((tally.composite_score(&weights) - 57.0).abs() < 1e-9);
    }

    #[test]
    fn test_analyze_hvt_designation() {
        let mut record = AoRecord::new("AO_1".into(), "Altis".into(), "defend".into(), 1);
        record.player("A").capture_points = 40.0;
        record.player("A").name = "Alice".into();
        record.player("B").capture_points = 25.0;
        record.player("B").name = "Bob".into();
        record.player("C").capture_points = 10.0;
        record.player("C").name = "Cem".into();
        record.group_kills.insert("GRP_P1".into(), 7);
        record.group_kills.insert("GRP_P2".into(), 3);
        record.group_kills.insert("GRP_P3".into(), 0);

        let cycle = |n: u64, orders: usize| CycleRecord {
            cycle: n,
            mission_time: n as f64 * 60.0,
            wall_time: Utc::now(),
            orders: (0..orders).map(|i| json!({"type": "move_to", "i": i})).collect(),
            rejected: vec![],
            commentary: format!("cycle {}", n),
            order_summary: vec![],
            objectives: vec![],
            threat_level: "LOW".into(),
            failure_note: None,
        };
        record.cycles.push(cycle(1, 8));
        record.cycles.push(cycle(2, 2));

        let analysis = analyze(&record, &HvtConfig::default());
        assert_eq!(analysis.total_cycles, 2);
        assert_eq!(analysis.total_orders_issued, 10);
        // Top-2 players by score; C(10) is cut.
        assert_eq!(analysis.hvt_players.len(), 2);
        assert_eq!(analysis.hvt_players[0].0, "A");
        assert!((analysis.hvt_players[0].2 - 40.0).abs() < 1e-9);
        assert_eq!(analysis.hvt_players[1].0, "B");
        // Groups with zero kills never designate.
        assert_eq!(analysis.hvt_groups, vec![("GRP_P1".to_string(), 7), ("GRP_P2".to_string(), 3)]);
    }

    #[test]
    fn test_analyze_empty_record() {
        let record = AoRecord::new("AO_2".into(), "Altis".into(), "defend".into(), 2);
        let analysis = analyze(&record, &HvtConfig::default());
        assert_eq!(analysis.total_cycles, 0);
        assert_eq!(analysis.total_orders_issued, 0);
        assert!(analysis.hvt_players.is_empty());
        assert!(analysis.hvt_groups.is_empty());
    }
}
