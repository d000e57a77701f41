//! Orders and commands
//!
//! An `Order` is what the LLM asked for, already coerced into a typed shape
//! by the parser but not yet trusted. A `Command` is an order that survived
//! the sandbox and carries its execution priority, cycle number, and
//! timestamp for the host drain.

use super::world::{Pos, Side};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// The closed set of command types the engine can ever emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    MoveTo,
    DefendArea,
    PatrolRoute,
    SeekAndDestroy,
    TransportGroup,
    EscortGroup,
    FireSupport,
    DeployAsset,
    SpawnSquad,
}

impl CommandType {
    pub fn parse(s: &str) -> Option<CommandType> {
        match s {
            "move_to" => Some(CommandType::MoveTo),
            "defend_area" => Some(CommandType::DefendArea),
            "patrol_route" => Some(CommandType::PatrolRoute),
            "seek_and_destroy" => Some(CommandType::SeekAndDestroy),
            "transport_group" => Some(CommandType::TransportGroup),
            "escort_group" => Some(CommandType::EscortGroup),
            "fire_support" => Some(CommandType::FireSupport),
            "deploy_asset" => Some(CommandType::DeployAsset),
            "spawn_squad" => Some(CommandType::SpawnSquad),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::MoveTo => "move_to",
            CommandType::DefendArea => "defend_area",
            CommandType::PatrolRoute => "patrol_route",
            CommandType::SeekAndDestroy => "seek_and_destroy",
            CommandType::TransportGroup => "transport_group",
            CommandType::EscortGroup => "escort_group",
            CommandType::FireSupport => "fire_support",
            CommandType::DeployAsset => "deploy_asset",
            CommandType::SpawnSquad => "spawn_squad",
        }
    }

    /// Commands that create a group instead of targeting one.
    pub fn spawns_group(&self) -> bool {
        matches!(self, CommandType::DeployAsset | CommandType::SpawnSquad)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed parameters, one variant per command type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderParams {
    MoveTo {
        position: Pos,
        speed: Option<String>,
        formation: Option<String>,
        behaviour: Option<String>,
        combat_mode: Option<String>,
    },
    DefendArea {
        position: Pos,
        radius: f64,
    },
    PatrolRoute {
        waypoints: Vec<Pos>,
        speed: Option<String>,
        behaviour: Option<String>,
    },
    SeekAndDestroy {
        position: Pos,
        radius: f64,
    },
    TransportGroup {
        passenger_group_id: String,
        pickup: Pos,
        dropoff: Pos,
    },
    EscortGroup {
        target_group_id: String,
        radius: f64,
    },
    FireSupport {
        position: Pos,
        radius: f64,
    },
    DeployAsset {
        side: Side,
        asset_type: String,
        unit_classes: Vec<String>,
        position: Pos,
        objective_id: Option<String>,
    },
    SpawnSquad {
        side: Side,
        unit_classes: Vec<String>,
        position: Pos,
        objective_id: Option<String>,
    },
}

impl OrderParams {
    pub fn command_type(&self) -> CommandType {
        match self {
            OrderParams::MoveTo { .. } => CommandType::MoveTo,
            OrderParams::DefendArea { .. } => CommandType::DefendArea,
            OrderParams::PatrolRoute { .. } => CommandType::PatrolRoute,
            OrderParams::SeekAndDestroy { .. } => CommandType::SeekAndDestroy,
            OrderParams::TransportGroup { .. } => CommandType::TransportGroup,
            OrderParams::EscortGroup { .. } => CommandType::EscortGroup,
            OrderParams::FireSupport { .. } => CommandType::FireSupport,
            OrderParams::DeployAsset { .. } => CommandType::DeployAsset,
            OrderParams::SpawnSquad { .. } => CommandType::SpawnSquad,
        }
    }

    /// Every position this order references, for geometry checks.
    pub fn positions(&self) -> Vec<Pos> {
        match self {
            OrderParams::MoveTo { position, .. }
            | OrderParams::DefendArea { position, .. }
            | OrderParams::SeekAndDestroy { position, .. }
            | OrderParams::FireSupport { position, .. }
            | OrderParams::DeployAsset { position, .. }
            | OrderParams::SpawnSquad { position, .. } => vec![*position],
            OrderParams::PatrolRoute { waypoints, .. } => waypoints.clone(),
            OrderParams::TransportGroup {
                pickup, dropoff, ..
            } => vec![*pickup, *dropoff],
            OrderParams::EscortGroup { .. } => vec![],
        }
    }

    pub fn radius(&self) -> Option<f64> {
        match self {
            OrderParams::DefendArea { radius, .. }
            | OrderParams::SeekAndDestroy { radius, .. }
            | OrderParams::EscortGroup { radius, .. }
            | OrderParams::FireSupport { radius, .. } => Some(*radius),
            _ => None,
        }
    }
}

/// An LLM order, pre-validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Target group; empty for spawn/deploy orders
    pub group_id: String,
    pub params: OrderParams,
    /// LLM-supplied priority, 0-10 scale
    pub priority: Option<f64>,
    pub objective_id: Option<String>,
}

impl Order {
    pub fn command_type(&self) -> CommandType {
        self.params.command_type()
    }

    /// Wire shape, symmetric with what the parser accepts.
    pub fn to_value(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("type".into(), json!(self.command_type().as_str()));
        if !self.group_id.is_empty() {
            obj.insert("group_id".into(), json!(self.group_id));
        }
        match &self.params {
            OrderParams::MoveTo {
                position,
                speed,
                formation,
                behaviour,
                combat_mode,
            } => {
                obj.insert("position".into(), json!(position));
                if let Some(v) = speed {
                    obj.insert("speed".into(), json!(v));
                }
                if let Some(v) = formation {
                    obj.insert("formation".into(), json!(v));
                }
                if let Some(v) = behaviour {
                    obj.insert("behaviour".into(), json!(v));
                }
                if let Some(v) = combat_mode {
                    obj.insert("combat_mode".into(), json!(v));
                }
            }
            OrderParams::DefendArea { position, radius }
            | OrderParams::SeekAndDestroy { position, radius }
            | OrderParams::FireSupport { position, radius } => {
                obj.insert("position".into(), json!(position));
                obj.insert("radius".into(), json!(radius));
            }
            OrderParams::PatrolRoute {
                waypoints,
                speed,
                behaviour,
            } => {
                obj.insert("waypoints".into(), json!(waypoints));
                if let Some(v) = speed {
                    obj.insert("speed".into(), json!(v));
                }
                if let Some(v) = behaviour {
                    obj.insert("behaviour".into(), json!(v));
                }
            }
            OrderParams::TransportGroup {
                passenger_group_id,
                pickup,
                dropoff,
            } => {
                obj.insert("passenger_group_id".into(), json!(passenger_group_id));
                obj.insert("pickup".into(), json!(pickup));
                obj.insert("dropoff".into(), json!(dropoff));
            }
            OrderParams::EscortGroup {
                target_group_id,
                radius,
            } => {
                obj.insert("target_group_id".into(), json!(target_group_id));
                obj.insert("radius".into(), json!(radius));
            }
            OrderParams::DeployAsset {
                side,
                asset_type,
                unit_classes,
                position,
                objective_id,
            } => {
                obj.insert("side".into(), json!(side.as_str()));
                obj.insert("asset_type".into(), json!(asset_type));
                if !unit_classes.is_empty() {
                    obj.insert("unit_classes".into(), json!(unit_classes));
                }
                obj.insert("position".into(), json!(position));
                if let Some(v) = objective_id {
                    obj.insert("objective_id".into(), json!(v));
                }
            }
            OrderParams::SpawnSquad {
                side,
                unit_classes,
                position,
                objective_id,
            } => {
                obj.insert("side".into(), json!(side.as_str()));
                obj.insert("unit_classes".into(), json!(unit_classes));
                obj.insert("position".into(), json!(position));
                if let Some(v) = objective_id {
                    obj.insert("objective_id".into(), json!(v));
                }
            }
        }
        if let Some(p) = self.priority {
            obj.insert("priority".into(), json!(p));
        }
        if self.objective_id.is_some() && !matches!(&self.params, OrderParams::DeployAsset { .. } | OrderParams::SpawnSquad { .. }) {
            obj.insert("objective_id".into(), json!(self.objective_id));
        }
        Value::Object(obj)
    }
}

/// A validated order queued for the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub order: Order,
    /// Assigned execution priority, clamped to [0, 10]
    pub priority: u8,
    /// Milliseconds since engine start, monotonic
    pub timestamp_ms: u64,
    pub cycle: u64,
    pub validated: bool,
    /// Engine-chosen off-map spawn point for vehicle deployments; the
    /// ordered destination stays inside the AO.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spawn_seed: Option<Pos>,
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        self.order.command_type()
    }

    pub fn group_id(&self) -> &str {
        &self.order.group_id
    }

    /// Wire shape for the host drain.
    pub fn to_value(&self) -> Value {
        let mut v = self.order.to_value();
        if let Some(obj) = v.as_object_mut() {
            obj.insert("priority".into(), json!(self.priority));
            obj.insert("cycle".into(), json!(self.cycle));
            obj.insert("timestamp_ms".into(), json!(self.timestamp_ms));
            if let Some(seed) = self.spawn_seed {
                obj.insert("spawn_position".into(), json!(seed));
            }
        }
        v
    }
}
