// kiln-core/src/lib.rs

pub mod bottle;
pub mod build;
pub mod checksum;
pub mod fetch;
pub mod install;
pub mod pipeline;
pub mod process;

pub use bottle::{BottleCache, BottleKey};
pub use build::{InstallJob, NodeInstaller, SourceInstaller};
pub use pipeline::{BuildReport, Orchestrator, OrchestratorOptions};
