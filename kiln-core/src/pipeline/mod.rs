// kiln-core/src/pipeline/mod.rs
// Build orchestration over a resolved graph.

pub mod engine;
mod worker;

pub use engine::{BuildReport, Orchestrator, OrchestratorOptions};
