//! Objective evaluator
//!
//! Classifies each objective's tactical state from the current snapshot and
//! computes a dynamic priority. Pure: identical inputs always produce
//! identical outputs, and the result ordering is total (dynamic priority
//! descending, then smaller radius, then lexicographic id).

use crate::model::world::{dist_2d, Objective, Snapshot};
use serde::{Deserialize, Serialize};

/// Tactical state of an objective as derived from unit presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TacticalState {
    Secured,
    Contested,
    Threatened,
    Undefended,
}

impl TacticalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TacticalState::Secured => "secured",
            TacticalState::Contested => "contested",
            TacticalState::Threatened => "threatened",
            TacticalState::Undefended => "undefended",
        }
    }

    /// Priority modifier applied to the objective's base priority.
    fn modifier(&self) -> f64 {
        match self {
            TacticalState::Secured => 0.8,
            TacticalState::Undefended => 1.0,
            TacticalState::Contested => 1.2,
            TacticalState::Threatened => 1.5,
        }
    }
}

/// Evaluation result for one objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveEval {
    pub objective: Objective,
    pub state: TacticalState,
    pub friendly_count: u32,
    pub enemy_count: u32,
    pub dynamic_priority: f64,
}

fn derive_state(friendly: u32, enemy: u32) -> TacticalState {
    if enemy == 0 && friendly > 0 {
        TacticalState::Secured
    } else if enemy > 0 && enemy >= 2 * friendly {
        TacticalState::Threatened
    } else if enemy > 0 {
        TacticalState::Contested
    } else {
        TacticalState::Undefended
    }
}

fn dynamic_priority(base: f64, state: TacticalState) -> f64 {
    let raw = base * state.modifier();
    // Objectives on a 0-10 scale clamp there; larger bases clamp to 0-100.
    let cap = if base <= 10.0 { 10.0 } else { 100.0 };
    raw.clamp(0.0, cap)
}

/// Evaluate all objectives against the snapshot.
pub fn evaluate(snapshot: &Snapshot, objectives: &[Objective]) -> Vec<ObjectiveEval> {
    let mut evals: Vec<ObjectiveEval> = objectives
        .iter()
        .map(|obj| {
            let mut friendly = 0u32;
            let mut enemy = 0u32;
            for group in &snapshot.groups {
                if dist_2d(group.position(), &obj.position) > obj.radius {
                    continue;
                }
                if snapshot.controlled_sides.contains(&group.side()) {
                    friendly += group.unit_count();
                } else if !snapshot.friendly_sides.contains(&group.side()) {
                    enemy += group.unit_count();
                }
            }
            let state = derive_state(friendly, enemy);
            ObjectiveEval {
                state,
                friendly_count: friendly,
                enemy_count: enemy,
                dynamic_priority: dynamic_priority(obj.priority, state),
                objective: obj.clone(),
            }
        })
        .collect();

    evals.sort_by(|a, b| {
        b.dynamic_priority
            .partial_cmp(&a.dynamic_priority)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                a.objective
                    .radius
                    .partial_cmp(&b.objective.radius)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.objective.id.cmp(&b.objective.id))
    });
    evals
}
