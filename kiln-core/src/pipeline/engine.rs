// kiln-core/src/pipeline/engine.rs
// The coordinator: owns every node's state on one thread and feeds a
// bounded worker pool, never holding more work than it has free slots.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::unbounded;
use kiln_common::config::Config;
use kiln_common::dependency::{BuildGraph, NodeId};
use kiln_common::keg::KegRegistry;
use kiln_common::pipeline::{FailureReason, InstallResult, JobProcessingState, PipelineEvent};
use threadpool::ThreadPool;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

use super::worker::{self, NodeTask, WorkerShared};
use crate::bottle::{current_platform, BottleCache};
use crate::build::NodeInstaller;
use crate::install::link::link_keg;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Maximum nodes installing at once.
    pub jobs: usize,
    /// Skip the bottle cache and declared bottles.
    pub build_from_source: bool,
    pub run_tests: bool,
    /// Pack successful source builds into the bottle cache.
    pub store_bottles: bool,
    /// Create opt/ and bin/ links after each successful node.
    pub link: bool,
}

impl OrchestratorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            jobs: config.jobs.max(1),
            build_from_source: false,
            run_tests: false,
            store_bottles: config.store_bottles,
            link: true,
        }
    }
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            jobs: num_cpus::get().max(1),
            build_from_source: false,
            run_tests: false,
            store_bottles: false,
            link: true,
        }
    }
}

/// Terminal result of every node of one orchestration, indexed by node.
#[derive(Debug, Clone)]
pub struct BuildReport {
    ids: Vec<NodeId>,
    results: Vec<InstallResult>,
    roots: Vec<NodeId>,
    pub duration: Duration,
}

impl BuildReport {
    pub fn result(&self, id: NodeId) -> &InstallResult {
        &self.results[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &InstallResult)> + '_ {
        self.ids.iter().copied().zip(self.results.iter())
    }

    pub fn into_map(self) -> BTreeMap<NodeId, InstallResult> {
        self.ids.into_iter().zip(self.results).collect()
    }

    pub fn success_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, InstallResult::Success { .. }))
            .count()
    }

    pub fn skipped_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, InstallResult::Skipped(_)))
            .count()
    }

    pub fn fail_count(&self) -> usize {
        self.results.iter().filter(|r| !r.is_ok()).count()
    }

    /// True when every requested root succeeded or was skipped.
    pub fn roots_ok(&self) -> bool {
        self.roots.iter().all(|r| self.result(*r).is_ok())
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }
}

pub(crate) fn get_panic_message(e: Box<dyn std::any::Any + Send>) -> String {
    match e.downcast_ref::<&'static str>() {
        Some(s) => (*s).to_string(),
        None => match e.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => "Unknown panic payload".to_string(),
        },
    }
}

pub struct Orchestrator {
    config: Config,
    cache: Arc<BottleCache>,
    installer: Arc<dyn NodeInstaller>,
    options: OrchestratorOptions,
    platform: String,
    cancel: Arc<AtomicBool>,
    event_tx: Option<broadcast::Sender<PipelineEvent>>,
}

impl Orchestrator {
    pub fn new(config: Config, installer: Arc<dyn NodeInstaller>) -> Self {
        Self {
            cache: Arc::new(BottleCache::from_config(&config)),
            options: OrchestratorOptions::from_config(&config),
            config,
            installer,
            platform: current_platform(),
            cancel: Arc::new(AtomicBool::new(false)),
            event_tx: None,
        }
    }

    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cache(mut self, cache: Arc<BottleCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    pub fn with_events(mut self, event_tx: broadcast::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Flag that stops new nodes from starting once set. Installs already
    /// running finish normally.
    pub fn cancellation_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    fn send(&self, event: PipelineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Installs every node of `graph`, dependencies first.
    #[instrument(skip_all, fields(nodes = graph.len()))]
    pub fn build(&self, graph: &BuildGraph) -> BuildReport {
        let started = Instant::now();
        let jobs = self.options.jobs.max(1);
        let registry = KegRegistry::new(self.config.clone());
        let shared = Arc::new(WorkerShared {
            config: self.config.clone(),
            cache: Arc::clone(&self.cache),
            installer: Arc::clone(&self.installer),
            options: self.options.clone(),
            platform: self.platform.clone(),
            event_tx: self.event_tx.clone(),
        });

        let mut states: Vec<JobProcessingState> = graph
            .nodes()
            .map(|(id, _)| {
                if graph.prerequisites(id).is_empty() {
                    JobProcessingState::Ready
                } else {
                    JobProcessingState::WaitingForDependencies
                }
            })
            .collect();
        let mut kegs: Vec<Option<PathBuf>> = vec![None; graph.len()];
        let order = graph.topological_order();

        self.send(PipelineEvent::PipelineStarted {
            total_jobs: graph.len(),
        });
        info!(
            "Orchestrating {} node(s) with up to {} concurrent install(s)",
            graph.len(),
            jobs
        );

        let pool = ThreadPool::new(jobs);
        let (outcome_tx, outcome_rx) = unbounded::<(NodeId, InstallResult)>();
        let mut active = 0usize;

        loop {
            if self.cancel.load(Ordering::SeqCst) {
                self.cancel_pending(graph, &mut states);
            } else {
                while active < jobs {
                    let Some(id) = next_ready(&order, &states) else {
                        break;
                    };
                    let node = graph.node(id);
                    let dependency_kegs: BTreeMap<String, PathBuf> = graph
                        .prerequisites(id)
                        .iter()
                        .filter_map(|p| {
                            kegs[p.index()]
                                .clone()
                                .map(|k| (graph.node(*p).name().to_string(), k))
                        })
                        .collect();
                    let task = NodeTask {
                        node: node.clone(),
                        keg: registry.keg_path(node),
                        dependency_kegs,
                    };
                    debug!("[{}] Dispatching {} to worker pool", node.name(), id);
                    states[id.index()] = JobProcessingState::DispatchedToCore;
                    self.send(PipelineEvent::JobDispatchedToCore {
                        target_id: node.name().to_string(),
                    });

                    let shared = Arc::clone(&shared);
                    let tx = outcome_tx.clone();
                    pool.execute(move || {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            worker::execute_node(&task, &shared)
                        }))
                        .unwrap_or_else(|e| {
                            let msg = get_panic_message(e);
                            error!("[{}] worker panicked: {}", task.node.name(), msg);
                            InstallResult::Failed(FailureReason::InstallFailure(format!(
                                "worker panicked: {msg}"
                            )))
                        });
                        let _ = tx.send((id, result));
                    });
                    active += 1;
                }
            }

            if active == 0 {
                break;
            }
            let (id, result) = match outcome_rx.recv() {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Worker outcome channel closed unexpectedly: {}", e);
                    break;
                }
            };
            active -= 1;
            self.finish_node(graph, id, result, &mut states, &mut kegs);
        }
        pool.join();

        let results: Vec<InstallResult> = states
            .into_iter()
            .map(|state| match state {
                JobProcessingState::Finished(result) => result,
                other => {
                    warn!("Node left in state {:?}; treating as cancelled", other);
                    InstallResult::Failed(FailureReason::Cancelled)
                }
            })
            .collect();
        let report = BuildReport {
            ids: graph.topological_order(),
            results,
            roots: graph.roots().to_vec(),
            duration: started.elapsed(),
        };
        self.send(PipelineEvent::PipelineFinished {
            duration_secs: report.duration.as_secs_f64(),
            success_count: report.success_count(),
            skipped_count: report.skipped_count(),
            fail_count: report.fail_count(),
        });
        let failures = report.fail_count();
        if failures > 0 {
            error!("Operation failed with {} total failure(s).", failures);
        } else {
            info!("All {} node(s) installed", graph.len());
        }
        report
    }

    fn finish_node(
        &self,
        graph: &BuildGraph,
        id: NodeId,
        result: InstallResult,
        states: &mut [JobProcessingState],
        kegs: &mut [Option<PathBuf>],
    ) {
        let node = graph.node(id);
        let mut result = result;
        if self.options.link {
            if let Some(keg) = result.keg().map(|k| k.to_path_buf()) {
                self.send(PipelineEvent::LinkStarted {
                    target_id: node.name().to_string(),
                });
                if let Err(e) = link_keg(&node.formula, &keg, &self.config) {
                    error!("[{}] linking failed: {}", node.name(), e);
                    result = InstallResult::Failed(FailureReason::InstallFailure(format!(
                        "linking failed: {e}"
                    )));
                }
            }
        }
        debug!("[{}] finished: {}", node.name(), result.label());
        self.send(PipelineEvent::for_result(node.name().to_string(), &result));

        if result.is_ok() {
            kegs[id.index()] = result.keg().map(|k| k.to_path_buf());
            states[id.index()] = JobProcessingState::Finished(result);
            for dependent in graph.dependents(id) {
                let waiting = matches!(
                    states[dependent.index()],
                    JobProcessingState::WaitingForDependencies
                );
                if waiting && are_dependencies_succeeded(graph, *dependent, states) {
                    states[dependent.index()] = JobProcessingState::Ready;
                }
            }
        } else {
            states[id.index()] = JobProcessingState::Finished(result);
            self.propagate_failure(graph, id, states);
        }
    }

    fn propagate_failure(&self, graph: &BuildGraph, failed: NodeId, states: &mut [JobProcessingState]) {
        let failed_name = graph.node(failed).name().to_string();
        for dependent in graph.dependents_transitive(failed) {
            if states[dependent.index()].is_terminal() {
                continue;
            }
            let name = graph.node(dependent).name().to_string();
            debug!("[{}] PropagateFailure: blocked by '{}'", name, failed_name);
            let result = InstallResult::Failed(FailureReason::DependencyFailed(failed_name.clone()));
            self.send(PipelineEvent::for_result(name, &result));
            states[dependent.index()] = JobProcessingState::Finished(result);
        }
    }

    fn cancel_pending(&self, graph: &BuildGraph, states: &mut [JobProcessingState]) {
        for (id, node) in graph.nodes() {
            if matches!(
                states[id.index()],
                JobProcessingState::WaitingForDependencies | JobProcessingState::Ready
            ) {
                let result = InstallResult::Failed(FailureReason::Cancelled);
                self.send(PipelineEvent::for_result(node.name().to_string(), &result));
                states[id.index()] = JobProcessingState::Finished(result);
            }
        }
    }
}

fn next_ready(order: &[NodeId], states: &[JobProcessingState]) -> Option<NodeId> {
    order
        .iter()
        .copied()
        .find(|id| matches!(states[id.index()], JobProcessingState::Ready))
}

fn are_dependencies_succeeded(graph: &BuildGraph, id: NodeId, states: &[JobProcessingState]) -> bool {
    graph.prerequisites(id).iter().all(|p| {
        matches!(&states[p.index()], JobProcessingState::Finished(result) if result.is_ok())
    })
}
