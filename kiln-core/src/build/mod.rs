// kiln-core/src/build/mod.rs
// Source builds: the per-node environment, sandbox and step execution.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kiln_common::config::Config;
use kiln_common::dependency::BuildNode;
use kiln_common::error::Result;
use kiln_common::pipeline::PipelineEvent;
use tokio::sync::broadcast;

pub mod env;
pub mod sandbox;
pub mod source;
pub mod steps;

pub use env::BuildEnvironment;
pub use source::SourceInstaller;

/// Everything an installer needs to populate one keg.
pub struct InstallJob<'a> {
    pub node: &'a BuildNode,
    /// Keg to install into. Exists and is empty when the job starts.
    pub keg: &'a Path,
    /// Keg of every direct prerequisite, by formula name.
    pub dependency_kegs: &'a BTreeMap<String, PathBuf>,
    pub config: &'a Config,
    pub run_tests: bool,
    pub event_tx: Option<&'a broadcast::Sender<PipelineEvent>>,
}

impl InstallJob<'_> {
    pub fn send(&self, event: PipelineEvent) {
        if let Some(tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }
}

/// Runs a node's install procedure. Implementations must be callable from
/// several worker threads at once, each with its own job.
pub trait NodeInstaller: Send + Sync {
    fn install(&self, job: &InstallJob<'_>) -> Result<()>;
}
