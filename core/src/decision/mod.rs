pub mod evaluator;

pub use evaluator::{evaluate, ObjectiveEval, TacticalState};
