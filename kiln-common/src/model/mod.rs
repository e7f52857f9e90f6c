// kiln-common/src/model/mod.rs
pub mod activation;
pub mod environment;
pub mod formula;
pub mod option;
pub mod step;

pub use activation::Activation;
pub use environment::{BuildSettings, NodeEnvironment};
pub use formula::{
    parse_version, BottleFileSpec, BottleSpec, CompilerFeature, CompilerNeed, Formula, FormulaId,
};
pub use option::{
    resolve_options, OptionDecl, OptionKind, OptionSet, OptionValue, ResolvedOptions,
    UnknownOptionWarning,
};
pub use step::{BuildStep, StepAction, StepArg};
