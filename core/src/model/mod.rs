//! World and order data models
//!
//! These types are the engine's internal representation of the battlefield
//! and of LLM-issued orders. Everything crossing the bridge is normalized
//! into these records at the trust boundary; raw maps never travel further.

pub mod orders;
pub mod world;

pub use orders::{Command, CommandType, Order, OrderParams};
pub use world::{
    CasualtyEvent, Group, GroupClass, Objective, ObjectiveState, Player, Pos, Side, Snapshot,
    Waypoint,
};
