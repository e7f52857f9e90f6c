// kiln/src/pipeline.rs
pub mod runner;
