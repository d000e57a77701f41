//! Engine state manager
//!
//! Owns everything that outlives a single snapshot: admin-injected
//! configuration (sides, intent, guardrails, resource pool), the AO
//! lifecycle with its accumulating record, the group-side registry, and
//! cross-AO retention of sealed analyses.

pub mod ao;
pub mod resources;

pub use ao::{analyze, AnalysisData, AoRecord, CycleRecord, HvtConfig, PlayerTally, RejectedOrder};
pub use resources::ResourcePool;

use crate::config::{AoBounds, AiConfig, EngineConfig};
use crate::error::{EngineError, Result};
use crate::model::world::{dist_2d, Objective, Side, Snapshot};
use ao::{event_points, PROXIMITY_BONUS};
use std::collections::{HashMap, VecDeque};

/// AO lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AoPhase {
    Idle,
    Running,
    Ended,
}

/// How many sealed AO analyses stay in memory for cross-AO seeding.
pub const MAX_RETAINED_AOS: usize = 3;

pub struct StateManager {
    // Admin-set mission configuration
    pub deployed: bool,
    pub mission_intent: String,
    pub friendly_sides: Vec<Side>,
    pub controlled_sides: Vec<Side>,
    pub controlled_group_overrides: Vec<String>,
    pub objectives: Vec<Objective>,
    pub hvt_player_designations: Vec<String>,
    pub hvt_group_designations: Vec<String>,

    // Guardrails
    pub ao_bounds: Option<AoBounds>,
    pub resource_pool: ResourcePool,
    ao_defense_phase: bool,

    // Runtime AI configuration (config overlaid by admin updates)
    pub ai: AiConfig,
    pub api_keys: HashMap<String, String>,
    pub hvt: HvtConfig,

    // AO lifecycle
    phase: AoPhase,
    current_ao: Option<AoRecord>,
    recent_aos: VecDeque<AnalysisData>,
    /// Sealed analysis pending injection into the next AO's cached context
    pending_intel: Option<AnalysisData>,

    // World tracking
    pub last_snapshot: Option<Snapshot>,
    last_mission_time: Option<f64>,
    /// First-observed side per group id; ids never rebind
    group_sides: HashMap<String, Side>,
    /// Engine-spawned units per side this AO (counted toward the side cap)
    pub spawned_units: HashMap<Side, u32>,
}

impl StateManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            deployed: false,
            mission_intent: String::new(),
            friendly_sides: Vec::new(),
            controlled_sides: Vec::new(),
            controlled_group_overrides: Vec::new(),
            objectives: Vec::new(),
            hvt_player_designations: Vec::new(),
            hvt_group_designations: Vec::new(),
            ao_bounds: config.guardrails.ao_bounds.clone(),
            resource_pool: ResourcePool::from_config(&config.guardrails.resource_pool),
            ao_defense_phase: false,
            ai: config.ai.clone(),
            api_keys: HashMap::new(),
            hvt: HvtConfig::default(),
            phase: AoPhase::Idle,
            current_ao: None,
            recent_aos: VecDeque::new(),
            pending_intel: None,
            last_snapshot: None,
            last_mission_time: None,
            group_sides: HashMap::new(),
            spawned_units: HashMap::new(),
        }
    }

    // =========================================================================
    // Admin configuration
    // =========================================================================

    pub fn set_mission_intent(&mut self, intent: String, clear_memory: bool) {
        self.mission_intent = intent;
        if clear_memory {
            self.recent_aos.clear();
            self.pending_intel = None;
            crate::info_log!("Mission memory cleared with new intent");
        }
    }

    pub fn set_friendly_sides(&mut self, sides: Vec<Side>) {
        self.friendly_sides = sides;
    }

    pub fn set_controlled_sides(&mut self, sides: Vec<Side>) {
        self.controlled_sides = sides;
    }

    pub fn deploy(&mut self) {
        self.deployed = true;
    }

    pub fn undeploy(&mut self) {
        self.deployed = false;
    }

    pub fn add_objective(&mut self, objective: Objective) {
        // Replace on id collision; admin re-injection updates in place.
        if let Some(existing) = self.objectives.iter_mut().find(|o| o.id == objective.id) {
            *existing = objective;
        } else {
            self.objectives.push(objective);
        }
    }

    pub fn remove_objective(&mut self, id: &str) -> bool {
        let before = self.objectives.len();
        self.objectives.retain(|o| o.id != id);
        self.objectives.len() != before
    }

    pub fn set_ao_bounds(&mut self, bounds: AoBounds) {
        self.ao_bounds = Some(bounds);
    }

    pub fn set_ao_defense_phase(&mut self, active: bool) {
        // Idempotent by construction.
        self.ao_defense_phase = active;
    }

    pub fn is_ao_defense_phase(&self) -> bool {
        self.ao_defense_phase
    }

    pub fn set_api_key(&mut self, provider: &str, key: String) {
        self.api_keys.insert(provider.to_ascii_lowercase(), key);
    }

    pub fn api_key_override(&self, provider: &str) -> Option<&str> {
        self.api_keys
            .get(&provider.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    pub fn update_ai_config(&mut self, update: &serde_json::Value) -> Result<()> {
        self.ai.merge_update(update)
    }

    pub fn set_hvt_designations(&mut self, players: Vec<String>, groups: Vec<String>) {
        self.hvt_player_designations = players;
        self.hvt_group_designations = groups;
    }

    // =========================================================================
    // AO lifecycle
    // =========================================================================

    pub fn phase(&self) -> AoPhase {
        self.phase
    }

    pub fn is_ao_active(&self) -> bool {
        self.phase == AoPhase::Running
    }

    pub fn start_ao(
        &mut self,
        ao_id: String,
        world_name: String,
        mission_name: String,
        ao_index: u32,
    ) -> Result<()> {
        if self.phase == AoPhase::Running {
            return Err(EngineError::StateViolation {
                message: format!(
                    "cannot start AO '{}': AO '{}' is still running",
                    ao_id,
                    self.current_ao.as_ref().map(|a| a.ao_id.as_str()).unwrap_or("?")
                ),
            });
        }
        self.current_ao = Some(AoRecord::new(ao_id.clone(), world_name, mission_name, ao_index));
        self.phase = AoPhase::Running;
        self.spawned_units.clear();
        // Seed the new AO with the most recent sealed analysis.
        self.pending_intel = self.recent_aos.back().cloned();
        crate::info_log!("AO started: {}", ao_id);
        Ok(())
    }

    pub fn end_ao(&mut self) -> Result<AnalysisData> {
        if self.phase != AoPhase::Running {
            return Err(EngineError::StateViolation {
                message: "no active AO to end".into(),
            });
        }
        let record = self.current_ao.take().expect("running phase has a record");
        let analysis = analyze(&record, &self.hvt);
        self.phase = AoPhase::Ended;
        self.recent_aos.push_back(analysis.clone());
        while self.recent_aos.len() > MAX_RETAINED_AOS {
            self.recent_aos.pop_front();
        }
        crate::info_log!(
            "AO ended: {} ({} cycles, {} orders)",
            analysis.ao_id,
            analysis.total_cycles,
            analysis.total_orders_issued
        );
        Ok(analysis)
    }

    /// Take the pending previous-AO intel; consumed once per AO so it only
    /// enters the cached context a single time.
    pub fn take_pending_intel(&mut self) -> Option<AnalysisData> {
        self.pending_intel.take()
    }

    pub fn recent_aos(&self) -> &VecDeque<AnalysisData> {
        &self.recent_aos
    }

    pub fn current_ao(&self) -> Option<&AoRecord> {
        self.current_ao.as_ref()
    }

    /// Append a cycle record. Cycle numbers must strictly increase.
    pub fn record_cycle(&mut self, record: CycleRecord) -> Result<()> {
        let Some(ao) = self.current_ao.as_mut() else {
            return Err(EngineError::StateViolation {
                message: "no active AO for cycle record".into(),
            });
        };
        if let Some(last) = ao.cycles.last() {
            if record.cycle <= last.cycle {
                return Err(EngineError::StateViolation {
                    message: format!(
                        "cycle number {} not after {}",
                        record.cycle, last.cycle
                    ),
                });
            }
            if record.mission_time < last.mission_time {
                return Err(EngineError::StateViolation {
                    message: "mission time moved backwards".into(),
                });
            }
        }
        ao.cycles.push(record);
        Ok(())
    }

    /// Record a host-reported capture event with proximity bonuses.
    #[allow(clippy::too_many_arguments)]
    pub fn record_progress_event(
        &mut self,
        event_type: &str,
        player_uid: &str,
        objective_id: Option<&str>,
        _objective_type: Option<&str>,
        _completion_method: Option<&str>,
        nearby_players: &[(String, String, String)],
    ) -> Result<f64> {
        // Player metadata from the latest snapshot, if known.
        let (name, group_id) = self
            .last_snapshot
            .as_ref()
            .and_then(|s| s.players.iter().find(|p| p.uid == player_uid))
            .map(|p| (p.name.clone(), p.group_id.clone()))
            .unwrap_or_default();

        let Some(ao) = self.current_ao.as_mut() else {
            return Err(EngineError::StateViolation {
                message: "no active AO for progress event".into(),
            });
        };

        let points = event_points(event_type);
        let tally = ao.player(player_uid);
        if !name.is_empty() {
            tally.name = name;
        }
        if !group_id.is_empty() {
            tally.group_id = group_id;
        }
        tally.capture_points += points;
        let _ = objective_id;

        for (uid, nearby_name, nearby_group) in nearby_players {
            let nearby = ao.player(uid);
            if !nearby_name.is_empty() {
                nearby.name = nearby_name.clone();
            }
            if !nearby_group.is_empty() {
                nearby.group_id = nearby_group.clone();
            }
            nearby.capture_points += PROXIMITY_BONUS;
        }

        Ok(points)
    }

    // =========================================================================
    // Snapshot accumulation
    // =========================================================================

    /// Fold a new snapshot into AO history and the group-side registry.
    pub fn update_from_snapshot(&mut self, snapshot: &Snapshot) {
        // Group ids never rebind to a different side; a rebind is a host
        // defect we log and ignore.
        for group in &snapshot.groups {
            match self.group_sides.get(group.id()) {
                None => {
                    self.group_sides.insert(group.id().to_string(), group.side());
                }
                Some(known) if *known != group.side() => {
                    crate::warn_log!(
                        "Group {} reported side {} but was first seen as {}; keeping original",
                        group.id(),
                        group.side(),
                        known
                    );
                }
                _ => {}
            }
        }

        if self.phase == AoPhase::Running {
            let dt = self
                .last_mission_time
                .map(|last| (snapshot.mission_time - last).clamp(0.0, 120.0))
                .unwrap_or(0.0);
            let proximity_radius = self.hvt.proximity_radius.min(100.0);

            // Copy out objective positions first to keep the borrow local.
            let active_objectives: Vec<([f64; 3], f64)> = self
                .active_objectives(snapshot)
                .iter()
                .map(|o| (o.position, o.radius))
                .collect();

            // Killer ids may be player uids or group ids; either way the
            // kill credits the matching ledger.
            let player_uids: Vec<(String, String)> = snapshot
                .players
                .iter()
                .map(|p| (p.uid.clone(), p.group_id.clone()))
                .collect();

            if let Some(ao) = self.current_ao.as_mut() {
                for event in &snapshot.casualty_events {
                    if let Some(killer) = &event.killer_id {
                        match player_uids.iter().find(|(uid, _)| uid == killer) {
                            Some((uid, group_id)) => {
                                ao.player(uid).kills += 1;
                                if !group_id.is_empty() {
                                    *ao.group_kills.entry(group_id.clone()).or_insert(0) += 1;
                                }
                            }
                            None => {
                                *ao.group_kills.entry(killer.clone()).or_insert(0) += 1;
                            }
                        }
                    }
                    ao.casualties.push(event.clone());
                }

                for (uid, count) in &snapshot.contributions {
                    ao.player(uid).objective_contributions += count;
                }

                if dt > 0.0 {
                    for player in &snapshot.players {
                        let near = active_objectives.iter().any(|(pos, radius)| {
                            dist_2d(&player.position, pos) <= radius.min(proximity_radius)
                        });
                        if near {
                            let tally = ao.player(&player.uid);
                            tally.proximity_time += dt;
                            if tally.name.is_empty() {
                                tally.name = player.name.clone();
                            }
                            if tally.group_id.is_empty() {
                                tally.group_id = player.group_id.clone();
                            }
                        }
                    }
                }
            }
        }

        self.last_mission_time = Some(snapshot.mission_time);
        self.last_snapshot = Some(snapshot.clone());
    }

    /// The registered side for a group id, if it has ever been observed.
    pub fn registered_side(&self, group_id: &str) -> Option<Side> {
        self.group_sides.get(group_id).copied()
    }

    /// Units the engine has spawned for a side this AO.
    pub fn note_spawn(&mut self, side: Side, units: u32) {
        *self.spawned_units.entry(side).or_insert(0) += units;
    }

    /// Admin objectives merged with snapshot objectives (admin wins on id),
    /// terminal states filtered out.
    pub fn active_objectives(&self, snapshot: &Snapshot) -> Vec<Objective> {
        let mut merged: Vec<Objective> = self.objectives.clone();
        for obj in &snapshot.objectives {
            if !merged.iter().any(|o| o.id == obj.id) {
                merged.push(obj.clone());
            }
        }
        merged.retain(|o| !o.state.is_terminal());
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::world::{
        CasualtyEvent, Group, GroupBase, GroupClass, ObjectiveState, Player,
    };

    fn manager() -> StateManager {
        StateManager::new(&EngineConfig::default())
    }

    fn controlled_group(id: &str, side: Side) -> Group {
        Group::Controlled {
            base: GroupBase {
                id: id.to_string(),
                side,
                class: GroupClass::Infantry,
                position: [5000.0, 5000.0, 0.0],
                unit_count: 6,
                behaviour: "AWARE".into(),
                combat_mode: "YELLOW".into(),
                formation: "WEDGE".into(),
                in_combat: false,
                waypoint: None,
            },
            casualties: 0,
            speed_mode: "NORMAL".into(),
        }
    }

    fn cycle(n: u64, mission_time: f64, orders: usize) -> CycleRecord {
        CycleRecord {
            cycle: n,
            mission_time,
            wall_time: chrono::Utc::now(),
            orders: (0..orders).map(|i| serde_json::json!({"n": i})).collect(),
            rejected: vec![],
            commentary: String::new(),
            order_summary: vec![],
            objectives: vec![],
            threat_level: "LOW".into(),
            failure_note: None,
        }
    }

    #[test]
    fn test_ao_lifecycle_transitions() {
        let mut state = manager();
        assert_eq!(state.phase(), AoPhase::Idle);
        assert!(state.end_ao().is_err());

        state
            .start_ao("AO_1".into(), "Altis".into(), "defend".into(), 1)
            .unwrap();
        assert_eq!(state.phase(), AoPhase::Running);
        // Starting while running is a violation.
        assert!(state
            .start_ao("AO_2".into(), "Altis".into(), "defend".into(), 2)
            .is_err());

        let analysis = state.end_ao().unwrap();
        assert_eq!(analysis.ao_id, "AO_1");
        assert_eq!(state.phase(), AoPhase::Ended);
        // Ended -> new AO is allowed.
        assert!(state
            .start_ao("AO_2".into(), "Altis".into(), "defend".into(), 2)
            .is_ok());
    }

    #[test]
    fn test_cycle_numbers_strictly_monotonic() {
        let mut state = manager();
        state
            .start_ao("AO_1".into(), "Altis".into(), "defend".into(), 1)
            .unwrap();
        state.record_cycle(cycle(1, 30.0, 2)).unwrap();
        state.record_cycle(cycle(2, 60.0, 1)).unwrap();
        assert!(state.record_cycle(cycle(2, 90.0, 1)).is_err());
        assert!(state.record_cycle(cycle(3, 10.0, 1)).is_err());
        state.record_cycle(cycle(3, 60.0, 1)).unwrap();
    }

    #[test]
    fn test_hvt_scoring_through_progress_events() {
        let mut state = manager();
        state
            .start_ao("AO_1".into(), "Altis".into(), "defend".into(), 1)
            .unwrap();
        state.record_cycle(cycle(1, 30.0, 8)).unwrap();
        state.record_cycle(cycle(2, 60.0, 2)).unwrap();

        state
            .record_progress_event("commanderCaptured", "A", Some("OBJ_HQ"), None, None, &[])
            .unwrap();
        state
            .record_progress_event(
                "hvtEliminated",
                "B",
                Some("OBJ_HVT"),
                None,
                None,
                &[("C".to_string(), "Cem".to_string(), "GRP_P3".to_string())],
            )
            .unwrap();

        let analysis = state.end_ao().unwrap();
        assert_eq!(analysis.total_cycles, 2);
        assert_eq!(analysis.total_orders_issued, 10);
        // A: 40 (commander captured), B: 25 (hvt killed), C: 10 (proximity);
        // top-2 returned.
        assert_eq!(analysis.hvt_players.len(), 2);
        assert_eq!(analysis.hvt_players[0].0, "A");
        assert!((analysis.hvt_players[0].2 - 40.0).abs() < 1e-9);
        assert_eq!(analysis.hvt_players[1].0, "B");
        assert!((analysis.hvt_players[1].2 - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_progress_event_outside_ao_is_violation() {
        let mut state = manager();
        assert!(state
            .record_progress_event("hvtEliminated", "A", None, None, None, &[])
            .is_err());
    }

    #[test]
    fn test_retained_aos_capped() {
        let mut state = manager();
        for i in 0..5 {
            state
                .start_ao(format!("AO_{}", i), "Altis".into(), "m".into(), i)
                .unwrap();
            state.end_ao().unwrap();
        }
        assert_eq!(state.recent_aos().len(), MAX_RETAINED_AOS);
        assert_eq!(state.recent_aos().front().unwrap().ao_id, "AO_2");
    }

    #[test]
    fn test_pending_intel_consumed_once() {
        let mut state = manager();
        state
            .start_ao("AO_1".into(), "Altis".into(), "m".into(), 1)
            .unwrap();
        state.end_ao().unwrap();
        state
            .start_ao("AO_2".into(), "Altis".into(), "m".into(), 2)
            .unwrap();
        let intel = state.take_pending_intel();
        assert!(intel.is_some());
        assert_eq!(intel.unwrap().ao_id, "AO_1");
        assert!(state.take_pending_intel().is_none());
    }

    #[test]
    fn test_group_side_registry_never_rebinds() {
        let mut state = manager();
        let snapshot = Snapshot {
            groups: vec![controlled_group("GRP_1", Side::East)],
            ..Default::default()
        };
        state.update_from_snapshot(&snapshot);
        assert_eq!(state.registered_side("GRP_1"), Some(Side::East));

        let rebound = Snapshot {
            groups: vec![controlled_group("GRP_1", Side::West)],
            ..Default::default()
        };
        state.update_from_snapshot(&rebound);
        assert_eq!(state.registered_side("GRP_1"), Some(Side::East));
    }

    #[test]
    fn test_snapshot_accumulates_casualties_and_kills() {
        let mut state = manager();
        state
            .start_ao("AO_1".into(), "Altis".into(), "m".into(), 1)
            .unwrap();
        let snapshot = Snapshot {
            mission_time: 60.0,
            casualty_events: vec![CasualtyEvent {
                victim_id: "GRP_W_1".into(),
                victim_side: Side::West,
                killer_id: Some("GRP_1".into()),
                killer_side: Some(Side::East),
                timestamp: 55.0,
                position: None,
                weapon: String::new(),
                objective_id: None,
            }],
            contributions: HashMap::from([("P1".to_string(), 2u32)]),
            ..Default::default()
        };
        state.update_from_snapshot(&snapshot);
        let ao = state.current_ao().unwrap();
        assert_eq!(ao.casualties.len(), 1);
        assert_eq!(ao.group_kills["GRP_1"], 1);
        assert_eq!(ao.players["P1"].objective_contributions, 2);
    }

    #[test]
    fn test_proximity_time_accumulates_for_nearby_players() {
        let mut state = manager();
        state.set_controlled_sides(vec![Side::East]);
        state
            .start_ao("AO_1".into(), "Altis".into(), "m".into(), 1)
            .unwrap();
        state.add_objective(Objective {
            id: "OBJ_1".into(),
            description: "hold".into(),
            priority: 10.0,
            position: [5000.0, 5000.0, 0.0],
            radius: 200.0,
            task_type: String::new(),
            state: ObjectiveState::Active,
            metadata: Default::default(),
        });

        let player = Player {
            name: "Alice".into(),
            uid: "P1".into(),
            side: Side::West,
            group_id: "GRP_P".into(),
            position: [5030.0, 5000.0, 0.0],
            is_in_vehicle: false,
            damage: 0.0,
            is_hvt: false,
        };
        let mut snapshot = Snapshot {
            mission_time: 60.0,
            players: vec![player],
            ..Default::default()
        };
        state.update_from_snapshot(&snapshot);
        snapshot.mission_time = 90.0;
        state.update_from_snapshot(&snapshot);

        let ao = state.current_ao().unwrap();
        assert!((ao.players["P1"].proximity_time - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_active_objectives_merge_and_filter() {
        let mut state = manager();
        state.add_objective(Objective {
            id: "ADMIN_1".into(),
            description: "admin".into(),
            priority: 9.0,
            position: [0.0, 0.0, 0.0],
            radius: 100.0,
            task_type: String::new(),
            state: ObjectiveState::Active,
            metadata: Default::default(),
        });
        let snapshot = Snapshot {
            objectives: vec![
                Objective {
                    id: "ADMIN_1".into(),
                    description: "host duplicate, ignored".into(),
                    priority: 1.0,
                    position: [0.0, 0.0, 0.0],
                    radius: 100.0,
                    task_type: String::new(),
                    state: ObjectiveState::Active,
                    metadata: Default::default(),
                },
                Objective {
                    id: "HOST_1".into(),
                    description: "from host".into(),
                    priority: 5.0,
                    position: [0.0, 0.0, 0.0],
                    radius: 100.0,
                    task_type: String::new(),
                    state: ObjectiveState::Completed,
                    metadata: Default::default(),
                },
                Objective {
                    id: "HOST_2".into(),
                    description: "live".into(),
                    priority: 5.0,
                    position: [0.0, 0.0, 0.0],
                    radius: 100.0,
                    task_type: String::new(),
                    state: ObjectiveState::Active,
                    metadata: Default::default(),
                },
            ],
            ..Default::default()
        };
        let active = state.active_objectives(&snapshot);
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].id, "ADMIN_1");
        assert_eq!(active[0].description, "admin");
        assert_eq!(active[1].id, "HOST_2");
    }
}
