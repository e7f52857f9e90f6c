// kiln-common/src/lib.rs
pub mod config;
pub mod dependency;
pub mod error;
pub mod formulary;
pub mod keg;
pub mod model;
pub mod pipeline;

// Re-export key types
pub use config::Config;
pub use dependency::{build_graph, build_graph_for_roots, BuildGraph, BuildNode, NodeId};
pub use error::{KilnError, Result};
pub use formulary::{FormulaRegistry, Formulary};
pub use model::{resolve_options, Formula, OptionSet};
