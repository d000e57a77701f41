//! World state snapshot types

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;

/// 3-D world position in meters
pub type Pos = [f64; 3];

/// 2-D distance between two positions
pub fn dist_2d(a: &Pos, b: &Pos) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    (dx * dx + dy * dy).sqrt()
}

/// Faction side. Spellings from the host are normalized on entry; anything
/// outside the table is a snapshot error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    East,
    West,
    Guer,
    Civ,
}

impl Side {
    /// Normalization table for host-side spellings.
    pub fn parse(s: &str) -> Option<Side> {
        match s.to_ascii_uppercase().as_str() {
            "EAST" | "OPFOR" | "RED" => Some(Side::East),
            "WEST" | "BLUFOR" => Some(Side::West),
            "GUER" | "RESISTANCE" | "INDEPENDENT" => Some(Side::Guer),
            "CIV" | "CIVILIAN" => Some(Side::Civ),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::East => "EAST",
            Side::West => "WEST",
            Side::Guer => "GUER",
            Side::Civ => "CIV",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Side {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Side {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Side::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown side: {}", s)))
    }
}

/// Tactical class of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupClass {
    Infantry,
    Motorized,
    Mechanized,
    Armor,
    AirRotary,
    AirFixed,
    Naval,
    Unknown,
}

impl GroupClass {
    pub fn parse(s: &str) -> GroupClass {
        match s.to_ascii_lowercase().as_str() {
            "infantry" => GroupClass::Infantry,
            "motorized" => GroupClass::Motorized,
            "mechanized" => GroupClass::Mechanized,
            "armor" => GroupClass::Armor,
            "air_rotary" => GroupClass::AirRotary,
            "air_fixed" => GroupClass::AirFixed,
            "naval" => GroupClass::Naval,
            _ => GroupClass::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupClass::Infantry => "infantry",
            GroupClass::Motorized => "motorized",
            GroupClass::Mechanized => "mechanized",
            GroupClass::Armor => "armor",
            GroupClass::AirRotary => "air_rotary",
            GroupClass::AirFixed => "air_fixed",
            GroupClass::Naval => "naval",
            GroupClass::Unknown => "unknown",
        }
    }

    /// Whether this class can carry passengers
    pub fn can_transport(&self) -> bool {
        matches!(
            self,
            GroupClass::Motorized
                | GroupClass::Mechanized
                | GroupClass::Armor
                | GroupClass::AirRotary
                | GroupClass::AirFixed
        )
    }

    /// Classes eligible to provide fire support
    pub fn can_fire_support(&self) -> bool {
        matches!(
            self,
            GroupClass::AirRotary
                | GroupClass::AirFixed
                | GroupClass::Armor
                | GroupClass::Mechanized
                | GroupClass::Motorized
        )
    }
}

/// Current waypoint as reported by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub kind: String,
    pub position: Pos,
}

/// Fields shared by controlled and merely-observed groups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBase {
    pub id: String,
    pub side: Side,
    pub class: GroupClass,
    pub position: Pos,
    pub unit_count: u32,
    pub behaviour: String,
    pub combat_mode: String,
    pub formation: String,
    pub in_combat: bool,
    pub waypoint: Option<Waypoint>,
}

/// An AI group. `is_controlled` is the discriminant: groups under engine
/// command carry casualty and posture detail, observed groups carry
/// fog-of-war knowledge as reported by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Group {
    Controlled {
        #[serde(flatten)]
        base: GroupBase,
        casualties: u32,
        speed_mode: String,
    },
    Observed {
        #[serde(flatten)]
        base: GroupBase,
        is_friendly: bool,
        /// Fog-of-war knowledge, [0, 4] as reported
        knowledge: f64,
    },
}

impl Group {
    pub fn base(&self) -> &GroupBase {
        match self {
            Group::Controlled { base, .. } => base,
            Group::Observed { base, .. } => base,
        }
    }

    pub fn id(&self) -> &str {
        &self.base().id
    }

    pub fn side(&self) -> Side {
        self.base().side
    }

    pub fn position(&self) -> &Pos {
        &self.base().position
    }

    pub fn unit_count(&self) -> u32 {
        self.base().unit_count
    }

    pub fn class(&self) -> GroupClass {
        self.base().class
    }

    pub fn is_controlled(&self) -> bool {
        matches!(self, Group::Controlled { .. })
    }

    pub fn is_friendly(&self) -> bool {
        match self {
            Group::Controlled { .. } => true,
            Group::Observed { is_friendly, .. } => *is_friendly,
        }
    }
}

/// A human player as reported by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub uid: String,
    pub side: Side,
    pub group_id: String,
    pub position: Pos,
    #[serde(default)]
    pub is_in_vehicle: bool,
    #[serde(default)]
    pub damage: f64,
    #[serde(default)]
    pub is_hvt: bool,
}

/// Objective lifecycle state. The engine re-derives tactical status from
/// snapshots; these terminal/administrative states come from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveState {
    Active,
    Captured,
    Destroyed,
    Completed,
    Failed,
}

impl ObjectiveState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ObjectiveState::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectiveState::Active => "active",
            ObjectiveState::Captured => "captured",
            ObjectiveState::Destroyed => "destroyed",
            ObjectiveState::Completed => "completed",
            ObjectiveState::Failed => "failed",
        }
    }
}

/// A mission objective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub id: String,
    pub description: String,
    /// Base priority, [0, 100]; a 0-10 scale is also accepted
    pub priority: f64,
    pub position: Pos,
    /// Effect radius in meters
    pub radius: f64,
    /// Free-form task tag, e.g. "defend_area"
    #[serde(default)]
    pub task_type: String,
    pub state: ObjectiveState,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Record of a unit death during the current AO
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CasualtyEvent {
    pub victim_id: String,
    pub victim_side: Side,
    #[serde(default)]
    pub killer_id: Option<String>,
    #[serde(default)]
    pub killer_side: Option<Side>,
    pub timestamp: f64,
    #[serde(default)]
    pub position: Option<Pos>,
    #[serde(default)]
    pub weapon: String,
    #[serde(default)]
    pub objective_id: Option<String>,
}

/// Immutable world snapshot for one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Snapshot {
    /// Seconds since AO start
    pub mission_time: f64,
    /// Day-time fraction, [0, 1)
    pub daytime: f64,
    /// overcast, rain, fog, wind
    pub weather: [f64; 4],
    pub world_name: String,
    pub mission_name: String,
    /// side -> total live AI units
    pub ai_deployment: HashMap<Side, u32>,
    pub groups: Vec<Group>,
    pub players: Vec<Player>,
    pub objectives: Vec<Objective>,
    pub mission_variables: HashMap<String, serde_json::Value>,
    pub mission_intent: String,
    pub friendly_sides: Vec<Side>,
    pub controlled_sides: Vec<Side>,
    pub casualty_events: Vec<CasualtyEvent>,
    /// player uid -> kills credited this snapshot
    pub contributions: HashMap<String, u32>,
}

impl Snapshot {
    pub fn controlled_groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter().filter(|g| g.is_controlled())
    }

    /// Groups that are neither controlled nor allied
    pub fn enemy_groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter().filter(move |g| {
            !g.is_controlled()
                && !self.friendly_sides.contains(&g.side())
                && !self.controlled_sides.contains(&g.side())
        })
    }

    pub fn group_by_id(&self, group_id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.id() == group_id)
    }

    pub fn is_night(&self) -> bool {
        self.daytime < 0.25 || self.daytime > 0.85
    }
}
