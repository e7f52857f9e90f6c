// kiln-core/src/pipeline/worker.rs
// Runs on a pool thread: resolves one node to a terminal result.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_common::config::Config;
use kiln_common::dependency::BuildNode;
use kiln_common::error::{KilnError, Result};
use kiln_common::keg::{InstallReceipt, InstallSource, KegRegistry};
use kiln_common::pipeline::{FailureReason, InstallResult, PipelineEvent, SkipReason};
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use super::engine::OrchestratorOptions;
use crate::bottle::platform::platform_candidates;
use crate::bottle::{pack_keg, pour, BottleCache, BottleKey};
use crate::build::{InstallJob, NodeInstaller};
use crate::fetch;

/// State shared by every job of one orchestration.
pub(super) struct WorkerShared {
    pub config: Config,
    pub cache: Arc<BottleCache>,
    pub installer: Arc<dyn NodeInstaller>,
    pub options: OrchestratorOptions,
    pub platform: String,
    pub event_tx: Option<broadcast::Sender<PipelineEvent>>,
}

impl WorkerShared {
    fn send(&self, event: PipelineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

pub(super) struct NodeTask {
    pub node: BuildNode,
    pub keg: PathBuf,
    pub dependency_kegs: BTreeMap<String, PathBuf>,
}

#[instrument(skip_all, fields(node = %task.node))]
pub(super) fn execute_node(task: &NodeTask, shared: &WorkerShared) -> InstallResult {
    let target_id = task.node.name().to_string();
    shared.send(PipelineEvent::JobProcessingStarted {
        target_id: target_id.clone(),
    });
    match resolve_node(task, shared) {
        Ok(result) => result,
        Err(e) => {
            warn!("[{}] install failed: {}", target_id, e);
            discard_keg(&task.keg);
            InstallResult::Failed(FailureReason::InstallFailure(e.to_string()))
        }
    }
}

fn resolve_node(task: &NodeTask, shared: &WorkerShared) -> Result<InstallResult> {
    let node = &task.node;
    let target_id = node.name().to_string();

    let registry = KegRegistry::new(shared.config.clone());
    if let Some(installed) = registry.installed_for_node(node)? {
        debug!("[{}] already installed at {}", target_id, installed.path.display());
        return Ok(InstallResult::Skipped(SkipReason::AlreadyInstalled {
            keg: installed.path,
        }));
    }

    let key = BottleKey::for_node(node, &shared.platform, &task.keg);
    if !shared.options.build_from_source {
        if let Some(result) = pour_cached(task, shared, &key) {
            return Ok(result);
        }
        if let Some(result) = pour_declared(task, shared, &key) {
            return Ok(result);
        }
    }

    debug!("[{}] building from source into {}", target_id, task.keg.display());
    prepare_keg(&task.keg)?;
    let job = InstallJob {
        node,
        keg: &task.keg,
        dependency_kegs: &task.dependency_kegs,
        config: &shared.config,
        run_tests: shared.options.run_tests,
        event_tx: shared.event_tx.as_ref(),
    };
    if let Err(e) = shared.installer.install(&job) {
        discard_keg(&task.keg);
        return Ok(InstallResult::Failed(FailureReason::InstallFailure(
            e.to_string(),
        )));
    }

    if shared.options.store_bottles {
        if let Err(e) = store_built_keg(task, shared, &key) {
            warn!("[{}] could not store bottle: {}", target_id, e);
        }
    }
    InstallReceipt::for_node(node, InstallSource::Source).write(&task.keg)?;
    Ok(InstallResult::Success {
        keg: task.keg.clone(),
    })
}

fn pour_cached(task: &NodeTask, shared: &WorkerShared, key: &BottleKey) -> Option<InstallResult> {
    let target_id = task.node.name().to_string();
    let artifact = match shared.cache.lookup(key) {
        Ok(Some(artifact)) => artifact,
        Ok(None) => return None,
        Err(e) => {
            warn!("[{}] {}; falling back", target_id, e);
            if matches!(e, KilnError::Integrity(_)) {
                shared.send(PipelineEvent::IntegrityFailure {
                    target_id,
                    error: e.to_string(),
                });
            }
            return None;
        }
    };
    shared.send(PipelineEvent::CacheHit {
        target_id: target_id.clone(),
        digest: artifact.digest.clone(),
    });
    let source = InstallSource::Cache {
        digest: artifact.digest.clone(),
    };
    match pour_into_keg(task, &artifact.path, source) {
        Ok(()) => Some(InstallResult::Skipped(SkipReason::Bottle {
            artifact,
            keg: task.keg.clone(),
        })),
        Err(e) => {
            warn!("[{}] pouring cached bottle failed: {}", target_id, e);
            discard_keg(&task.keg);
            let _ = shared.cache.evict(key);
            None
        }
    }
}

// Declared bottles are built with default options, so other option sets
// never use them.
fn pour_declared(task: &NodeTask, shared: &WorkerShared, key: &BottleKey) -> Option<InstallResult> {
    let node = &task.node;
    if !node.uses_default_options() {
        return None;
    }
    let (platform, spec) = platform_candidates().into_iter().find_map(|p| {
        node.formula.bottle_for(&p).cloned().map(|spec| (p, spec))
    })?;
    let target_id = node.name().to_string();
    // Keyed by node identity; the file is removed once poured.
    let download = shared.config.downloads_dir().join(format!(
        "{}--{}-{}.{}.bottle.tar.gz",
        node.formula.name,
        node.formula.version_str_full(),
        node.short_identity(),
        platform
    ));

    shared.send(PipelineEvent::DownloadStarted {
        target_id: target_id.clone(),
        url: spec.url.clone(),
    });
    let outcome = fetch::fetch_verified(&spec.url, &download, &spec.sha256)
        .and_then(|path| {
            shared.send(PipelineEvent::DownloadFinished {
                target_id: target_id.clone(),
                path: path.clone(),
                size_bytes: path.metadata().map(|m| m.len()).unwrap_or(0),
            });
            shared.cache.store(key, &path, &spec.sha256)
        })
        .and_then(|artifact| {
            let source = InstallSource::Bottle {
                url: spec.url.clone(),
            };
            pour_into_keg(task, &artifact.path, source).map(|()| artifact)
        });
    let _ = fs::remove_file(&download);

    match outcome {
        Ok(artifact) => Some(InstallResult::Skipped(SkipReason::Bottle {
            artifact,
            keg: task.keg.clone(),
        })),
        Err(e) => {
            warn!("[{}] declared bottle unusable: {}; building from source", target_id, e);
            if matches!(e, KilnError::Integrity(_)) {
                shared.send(PipelineEvent::IntegrityFailure {
                    target_id,
                    error: e.to_string(),
                });
            }
            discard_keg(&task.keg);
            None
        }
    }
}

fn pour_into_keg(task: &NodeTask, archive: &Path, source: InstallSource) -> Result<()> {
    prepare_keg(&task.keg)?;
    pour(archive, &task.keg, &task.node.formula.name)?;
    InstallReceipt::for_node(&task.node, source).write(&task.keg)
}

fn store_built_keg(task: &NodeTask, shared: &WorkerShared, key: &BottleKey) -> Result<()> {
    let tmp = shared.config.tmp_dir();
    fs::create_dir_all(&tmp)?;
    let staged = tempfile::Builder::new()
        .prefix(&format!("{}-bottle-", task.node.name()))
        .suffix(".tar.gz")
        .tempfile_in(&tmp)?;
    let sha = pack_keg(&task.keg, staged.path())?;
    let artifact = shared.cache.store(key, staged.path(), &sha)?;
    debug!(
        "[{}] stored bottle {}",
        task.node.name(),
        &artifact.digest[..12]
    );
    Ok(())
}

/// Leaves an empty keg directory, removing whatever a previous attempt
/// left behind.
fn prepare_keg(keg: &Path) -> Result<()> {
    if keg.exists() {
        debug!("Removing stale keg contents at {}", keg.display());
        fs::remove_dir_all(keg)?;
    }
    fs::create_dir_all(keg)?;
    Ok(())
}

fn discard_keg(keg: &Path) {
    if keg.exists() {
        if let Err(e) = fs::remove_dir_all(keg) {
            warn!("Could not remove partial keg {}: {}", keg.display(), e);
        }
    }
}
