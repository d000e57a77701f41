//! Engine facade
//!
//! One `Engine` value owns the whole decision stack. The host-facing RPC
//! surface calls these methods; everything is serialized through a single
//! loop, so none of this needs interior synchronization.

use crate::commander::Commander;
use crate::config::{persist_guardrails, AoBounds, AssetSpec, EngineConfig};
use crate::error::{EngineError, Result};
use crate::model::world::{Objective, ObjectiveState, Side};
use crate::queue::CommandQueue;
use crate::state::{resources, AnalysisData, StateManager};
use crate::world::scanner;
use crate::{info_log, warn_log};
use serde_json::{json, Value};
use std::path::PathBuf;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Engine {
    pub config: EngineConfig,
    pub state: StateManager,
    pub commander: Commander,
    pub queue: CommandQueue,
    guardrails_path: PathBuf,
    runtime_objective_counter: u32,
}

impl Engine {
    /// Initialize from a configuration record. Applies the guardrails.json
    /// overlay, validates fatal constraints, and wires the provider.
    pub fn init(mut config: EngineConfig) -> Result<Engine> {
        let data_dir = PathBuf::from(&config.data_dir);
        crate::logger::init(
            data_dir.clone(),
            crate::logger::Level::parse(&config.logging.level),
            config.logging.echo_to_host_console,
        );
        info_log!("Initializing BATCOM engine v{}", VERSION);

        let guardrails_path = data_dir.join("guardrails.json");
        config.apply_guardrails_file(&guardrails_path);
        config.validate()?;

        let state = StateManager::new(&config);
        let mut commander = Commander::new(&config);
        let queue = CommandQueue::new(config.runtime.max_commands_per_tick);

        if config.ai.enabled {
            commander.init_provider(&config, &state)?;
        } else {
            info_log!("AI disabled - engine will accept snapshots but issue no orders");
        }

        info_log!(
            "Engine initialized (commands/tick {}, min_interval {:.0}s, sandbox {})",
            config.runtime.max_commands_per_tick,
            config.ai.min_interval,
            if config.safety.sandbox_enabled { "on" } else { "off" }
        );

        Ok(Engine {
            config,
            state,
            commander,
            queue,
            guardrails_path,
            runtime_objective_counter: 0,
        })
    }

    pub fn shutdown(&mut self) {
        if self.state.is_ao_active() {
            warn_log!("Shutdown with active AO; sealing record");
            let _ = self.state.end_ao();
        }
        self.commander.end_ao_tracking();
        self.queue.clear();
        info_log!("Engine shutdown complete");
    }

    // =========================================================================
    // Host data path
    // =========================================================================

    /// Ingest one raw snapshot tree. A bad snapshot mutates nothing.
    pub async fn world_snapshot(&mut self, raw: &Value) -> Result<()> {
        let snapshot = scanner::ingest(raw)?;
        self.commander
            .process_snapshot(&snapshot, &mut self.state, &mut self.queue)
            .await
    }

    /// Drain up to `max_commands_per_tick` commands for the host.
    pub fn pending_commands(&mut self) -> Vec<Value> {
        self.queue
            .drain(self.config.runtime.max_commands_per_tick)
            .iter()
            .map(|c| c.to_value())
            .collect()
    }

    pub async fn test_connection(&self) -> Result<(String, String)> {
        self.commander.test_connection().await
    }

    pub fn token_stats(&self) -> Value {
        self.commander.token_stats()
    }

    // =========================================================================
    // Admin operations
    // =========================================================================

    pub fn commander_brief(&mut self, intent: String, clear_memory: bool) {
        self.state.set_mission_intent(intent, clear_memory);
    }

    fn parse_sides(raw: &[String]) -> Result<Vec<Side>> {
        raw.iter()
            .map(|s| {
                Side::parse(s).ok_or_else(|| EngineError::StateViolation {
                    message: format!("unknown side '{}'", s),
                })
            })
            .collect()
    }

    pub fn commander_allies(&mut self, sides: &[String]) -> Result<()> {
        self.state.set_friendly_sides(Self::parse_sides(sides)?);
        Ok(())
    }

    pub fn commander_sides(&mut self, sides: &[String]) -> Result<()> {
        self.state.set_controlled_sides(Self::parse_sides(sides)?);
        Ok(())
    }

    pub fn control_groups(&mut self, group_ids: Vec<String>) {
        self.state.controlled_group_overrides = group_ids;
    }

    /// Add a mission objective from an admin task record.
    pub fn commander_task(&mut self, record: &Value) -> Result<String> {
        let description = record
            .get("description")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| EngineError::StateViolation {
                message: "task requires a non-empty description".into(),
            })?
            .to_string();
        let priority = record
            .get("priority")
            .and_then(|v| v.as_f64())
            .unwrap_or(5.0);
        let position = record
            .get("position")
            .and_then(|v| v.as_array())
            .map(|arr| {
                let mut pos = [0.0f64; 3];
                for (i, item) in arr.iter().take(3).enumerate() {
                    pos[i] = item.as_f64().unwrap_or(0.0);
                }
                pos
            })
            .unwrap_or([0.0, 0.0, 0.0]);
        let radius = record.get("radius").and_then(|v| v.as_f64()).unwrap_or(200.0);
        let task_type = record
            .get("task_type")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let metadata = record
            .get("metadata")
            .and_then(|v| v.as_object())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        self.runtime_objective_counter += 1;
        let id = format!("OBJ_RUNTIME_{}", self.runtime_objective_counter);
        self.state.add_objective(Objective {
            id: id.clone(),
            description,
            priority,
            position,
            radius,
            task_type,
            state: ObjectiveState::Active,
            metadata,
        });
        Ok(id)
    }

    pub fn remove_objective(&mut self, id: &str) -> Result<()> {
        if self.state.remove_objective(id) {
            Ok(())
        } else {
            Err(EngineError::StateViolation {
                message: format!("no objective '{}'", id),
            })
        }
    }

    /// Deploy or undeploy the commander. Deploying closes the breaker loop
    /// via a half-open probe when it was open.
    pub fn deploy_commander(&mut self, deploy: bool) -> Result<()> {
        if deploy {
            if self.state.controlled_sides.is_empty() {
                return Err(EngineError::StateViolation {
                    message: "no controlled sides configured; use commanderSides first".into(),
                });
            }
            self.state.deploy();
            self.commander.redeploy();
            info_log!("Commander deployed");
        } else {
            self.state.undeploy();
            info_log!("Commander undeployed");
        }
        Ok(())
    }

    /// Update AO bounds and/or the resource pool from a guardrails record.
    pub fn commander_guardrails(&mut self, record: &Value) -> Result<()> {
        if let Some(bounds_value) = record
            .get("ao_bounds")
            .or_else(|| record.get("bounds"))
            .filter(|v| !v.is_null())
        {
            let bounds: AoBounds = serde_json::from_value(bounds_value.clone())
                .map_err(|e| EngineError::StateViolation {
                    message: format!("invalid AO bounds: {}", e),
                })?;
            self.state.set_ao_bounds(bounds);
        }
        if let Some(pool_value) = record
            .get("resource_pool")
            .or_else(|| record.get("resources"))
            .filter(|v| !v.is_null())
        {
            let pool = Self::parse_resource_pool(pool_value)?;
            self.state.resource_pool.replace(pool);
        }
        Ok(())
    }

    fn parse_resource_pool(
        value: &Value,
    ) -> Result<std::collections::HashMap<Side, std::collections::HashMap<String, AssetSpec>>>
    {
        let map = value.as_object().ok_or_else(|| EngineError::StateViolation {
            message: "resource pool must be a map".into(),
        })?;
        let mut pool = std::collections::HashMap::new();
        for (raw_side, assets_value) in map {
            let side = Side::parse(raw_side).ok_or_else(|| EngineError::StateViolation {
                message: format!("unknown side '{}'", raw_side),
            })?;
            let assets_map =
                assets_value
                    .as_object()
                    .ok_or_else(|| EngineError::StateViolation {
                        message: format!("assets for {} must be a map", raw_side),
                    })?;
            let mut assets = std::collections::HashMap::new();
            for (asset_type, spec_value) in assets_map {
                // Accept `unit_classes` as an alias for `classnames`.
                let mut spec_value = spec_value.clone();
                if let Some(obj) = spec_value.as_object_mut() {
                    if !obj.contains_key("classnames") {
                        if let Some(classes) = obj.remove("unit_classes") {
                            obj.insert("classnames".into(), classes);
                        }
                    }
                }
                let spec: AssetSpec = serde_json::from_value(spec_value).map_err(|e| {
                    EngineError::StateViolation {
                        message: format!("invalid asset {}:{}: {}", raw_side, asset_type, e),
                    }
                })?;
                if spec.classnames.is_empty() {
                    return Err(EngineError::StateViolation {
                        message: format!("asset {}:{} has no classnames", raw_side, asset_type),
                    });
                }
                assets.insert(asset_type.clone(), spec);
            }
            pool.insert(side, assets);
        }
        Ok(pool)
    }

    pub fn set_llm_config(&mut self, record: &Value) -> Result<()> {
        self.state.update_ai_config(record)?;
        if let Err(e) = persist_guardrails(&self.guardrails_path, &self.state.ai) {
            warn_log!("Failed to persist LLM config: {}", e);
        }
        self.commander.init_provider(&self.config, &self.state)
    }

    pub fn set_llm_api_key(&mut self, provider: &str, api_key: &str) -> Result<()> {
        if provider.is_empty() || api_key.is_empty() {
            return Err(EngineError::StateViolation {
                message: "provider and api_key must be non-empty".into(),
            });
        }
        self.state.set_api_key(provider, api_key.to_string());
        if let Err(e) = persist_guardrails(&self.guardrails_path, &self.state.ai) {
            warn_log!("Failed to persist LLM config: {}", e);
        }
        self.commander.init_provider(&self.config, &self.state)
    }

    pub fn start_ao(
        &mut self,
        ao_id: String,
        world_name: String,
        mission_name: String,
    ) -> Result<()> {
        // The AO index is the first number embedded in the id, if any.
        let ao_index: u32 = ao_id
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .unwrap_or(0);
        // Strip any map suffix from "mission.Altis" style names.
        let mission_name = mission_name
            .split('.')
            .next()
            .unwrap_or(&mission_name)
            .to_string();

        self.state
            .start_ao(ao_id.clone(), world_name.clone(), mission_name.clone(), ao_index)?;
        self.commander
            .start_ao_tracking(&ao_id, &world_name, &mission_name, ao_index, &mut self.state);
        Ok(())
    }

    pub fn end_ao(&mut self) -> Result<AnalysisData> {
        let analysis = self.state.end_ao()?;
        self.commander.end_ao_tracking();
        Ok(analysis)
    }

    pub fn set_hvt(&mut self, players: Vec<String>, groups: Vec<String>) {
        self.state.set_hvt_designations(players, groups);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn ao_progress(
        &mut self,
        event_type: &str,
        player_uid: &str,
        objective_id: Option<&str>,
        objective_type: Option<&str>,
        completion_method: Option<&str>,
        nearby_players: &[(String, String, String)],
    ) -> Result<f64> {
        self.state.record_progress_event(
            event_type,
            player_uid,
            objective_id,
            objective_type,
            completion_method,
            nearby_players,
        )
    }

    pub fn resource_pool_add_asset(
        &mut self,
        side: &str,
        asset_type: &str,
        spec: AssetSpec,
    ) -> Result<()> {
        let side = Side::parse(side).ok_or_else(|| EngineError::StateViolation {
            message: format!("unknown side '{}'", side),
        })?;
        if spec.classnames.is_empty() {
            return Err(EngineError::StateViolation {
                message: "asset requires at least one classname".into(),
            });
        }
        self.state.resource_pool.add_asset(side, asset_type, spec);
        Ok(())
    }

    pub fn resource_pool_remove_asset(&mut self, side: &str, asset_type: &str) -> Result<()> {
        let side = Side::parse(side).ok_or_else(|| EngineError::StateViolation {
            message: format!("unknown side '{}'", side),
        })?;
        if self.state.resource_pool.remove_asset(side, asset_type) {
            Ok(())
        } else {
            Err(EngineError::StateViolation {
                message: format!("asset {}:{} not found", side, asset_type),
            })
        }
    }

    pub fn resource_pool_clear_side(&mut self, side: &str) -> Result<()> {
        let side = Side::parse(side).ok_or_else(|| EngineError::StateViolation {
            message: format!("unknown side '{}'", side),
        })?;
        self.state.resource_pool.clear_side(side);
        Ok(())
    }

    pub fn load_resource_template(&mut self, name: &str) -> Result<usize> {
        let template =
            resources::builtin_template(name).ok_or_else(|| EngineError::StateViolation {
                message: format!("template '{}' not found", name),
            })?;
        let total: usize = template.values().map(|assets| assets.len()).sum();
        self.state.resource_pool.replace(template);
        info_log!("Loaded resource template '{}' ({} asset types)", name, total);
        Ok(total)
    }

    pub fn list_resource_templates(&self) -> Vec<Value> {
        resources::template_names()
            .into_iter()
            .map(|(name, description)| json!({"name": name, "description": description}))
            .collect()
    }

    pub fn set_ao_defense_phase(&mut self, active: bool) {
        self.state.set_ao_defense_phase(active);
        info_log!(
            "AO defense phase {}",
            if active { "ACTIVATED" } else { "DEACTIVATED" }
        );
    }

    /// Hard kill switch: breaker open, in-flight call cancelled, caches and
    /// continuity cleared, commander undeployed.
    pub fn emergency_stop(&mut self) {
        self.commander.emergency_stop();
        self.state.undeploy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commander::tests::{test_config, MockProvider};
    use std::sync::Arc;

    fn engine() -> Engine {
        let mut config = test_config();
        config.ai.enabled = false; // wire a mock afterwards
        let mut engine = Engine::init(config).unwrap();
        engine
            .commander
            .set_provider(Arc::new(MockProvider::new(vec![])));
        engine.commander_sides(&["EAST".to_string()]).unwrap();
        engine.deploy_commander(true).unwrap();
        engine
    }

    fn snapshot_value(mission_time: f64) -> Value {
        json!({
            "mission_time": mission_time,
            "controlled_sides": ["EAST"],
            "groups": [{
                "id": "GRP_EAST_1",
                "side": "EAST",
                "type": "infantry",
                "position": [5050.0, 5050.0, 0.0],
                "unit_count": 8,
                "is_controlled": true
            }],
            "objectives": [{
                "id": "OBJ_1",
                "description": "Hold the crossroads",
                "priority": 10,
                "position": [5000.0, 5000.0, 0.0],
                "radius": 200.0
            }]
        })
    }

    #[tokio::test]
    async fn test_snapshot_flows_end_to_end() {
        let mut engine = engine();
        engine
            .start_ao("AO_1".into(), "Altis".into(), "defend.Altis".into())
            .unwrap();
        engine.world_snapshot(&snapshot_value(100.0)).await.unwrap();
        assert_eq!(engine.commander.cycle(), 1);
        // Mission name had its map suffix stripped.
        assert_eq!(engine.state.current_ao().unwrap().mission_name, "defend");
        assert_eq!(engine.state.current_ao().unwrap().ao_index, 1);
    }

    #[tokio::test]
    async fn test_bad_snapshot_is_rejected_without_mutation() {
        let mut engine = engine();
        let err = engine
            .world_snapshot(&json!({"groups": [{"id": "x"}]}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BadSnapshot { .. }));
        assert!(engine.state.last_snapshot.is_none());
    }

    #[test]
    fn test_deploy_requires_controlled_sides() {
        let mut config = test_config();
        config.ai.enabled = false;
        let mut engine = Engine::init(config).unwrap();
        assert!(engine.deploy_commander(true).is_err());
        engine.commander_sides(&["EAST".to_string()]).unwrap();
        assert!(engine.deploy_commander(true).is_ok());
    }

    #[test]
    fn test_commander_task_creates_objectives() {
        let mut engine = engine();
        let id = engine
            .commander_task(&json!({
                "description": "Defend the radio tower",
                "priority": 8,
                "position": [5100.0, 4900.0, 0.0],
                "radius": 150,
                "task_type": "defend_radiotower"
            }))
            .unwrap();
        assert_eq!(id, "OBJ_RUNTIME_1");
        assert_eq!(engine.state.objectives.len(), 1);
        assert!(engine
            .commander_task(&json!({"priority": 5}))
            .is_err());
    }

    #[test]
    fn test_guardrails_update() {
        let mut engine = engine();
        engine
            .commander_guardrails(&json!({
                "ao_bounds": {"center": [4000.0, 4000.0], "radius": 2000.0},
                "resource_pool": {
                    "EAST": {
                        "infantry_squad": {"unit_classes": ["A", "B"], "max": 3}
                    }
                }
            }))
            .unwrap();
        assert!(engine.state.ao_bounds.is_some());
        assert_eq!(
            engine.state.resource_pool.remaining(Side::East, "infantry_squad"),
            Some(3)
        );
        // Unknown side in the pool is a violation.
        assert!(engine
            .commander_guardrails(&json!({"resource_pool": {"PURPLE": {}}}))
            .is_err());
    }

    #[test]
    fn test_resource_template_lifecycle() {
        let mut engine = engine();
        let count = engine.load_resource_template("standard").unwrap();
        assert!(count > 0);
        assert!(engine.load_resource_template("bogus").is_err());
        assert_eq!(engine.list_resource_templates().len(), 3);
    }

    #[test]
    fn test_end_ao_from_idle_is_violation() {
        let mut engine = engine();
        let err = engine.end_ao().unwrap_err();
        assert!(matches!(err, EngineError::StateViolation { .. }));
    }

    #[tokio::test]
    async fn test_emergency_stop_blocks_decisions() {
        let mut engine = engine();
        engine
            .start_ao("AO_1".into(), "Altis".into(), "m".into())
            .unwrap();
        engine.emergency_stop();
        assert!(!engine.state.deployed);
        // Snapshots are still accepted; no decisions are made.
        engine.world_snapshot(&snapshot_value(100.0)).await.unwrap();
        assert_eq!(engine.commander.cycle(), 0);
    }

    #[test]
    fn test_pending_commands_respects_drain_cap() {
        let mut engine = engine();
        engine.config.runtime.max_commands_per_tick = 2;
        for p in [5u8, 6, 7, 8] {
            let order = crate::model::orders::Order {
                group_id: "GRP_1".into(),
                params: crate::model::orders::OrderParams::MoveTo {
                    position: [0.0, 0.0, 0.0],
                    speed: None,
                    formation: None,
                    behaviour: None,
                    combat_mode: None,
                },
                priority: Some(p as f64),
                objective_id: None,
            };
            engine.queue.enqueue(crate::model::orders::Command {
                order,
                priority: p,
                timestamp_ms: 0,
                cycle: 1,
                validated: true,
                spawn_seed: None,
            });
        }
        let drained = engine.pending_commands();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0]["priority"], 8);
    }
}
