//! Exchange policy evaluation.

pub mod cache;
pub mod engine;

pub use cache::{DecisionCache, DecisionKey};
pub use engine::{evaluate, Decision, EvaluationRequest};
