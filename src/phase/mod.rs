//! Phase machine and transition gating.
//!
//! The machine declares which edges exist; the gate evaluator decides
//! whether a given session currently satisfies an edge's requirements.

mod gate;
mod machine;

pub use gate::{GateDecision, GateEvaluator, Requirement, TransitionRule};
pub use machine::Phase;
