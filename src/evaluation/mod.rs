//! Deterministic rule evaluation: segment and condition matching, consistent-hash bucketing.
mod context;
mod engine;
pub mod models;
mod rules;
mod select;
mod version;

pub use context::EvaluationContext;
pub use engine::evaluate;
pub(crate) use engine::evaluate_with_sharder;
pub use models::{Flag, Operator, Variant};
pub use version::Version;
