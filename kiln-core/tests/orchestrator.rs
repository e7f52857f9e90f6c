//! Orchestration over small graphs with a recording installer.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use kiln_common::config::Config;
use kiln_common::dependency::{build_graph, build_graph_for_roots, GraphOptions};
use kiln_common::error::{KilnError, Result};
use kiln_common::model::{resolve_options, Formula};
use kiln_common::pipeline::{FailureReason, InstallResult, PipelineEvent, SkipReason};
use kiln_common::BuildGraph;
use kiln_core::bottle::BottleKey;
use kiln_core::build::{InstallJob, NodeInstaller};
use kiln_core::{BottleCache, Orchestrator, OrchestratorOptions};
use tokio::sync::broadcast;

#[derive(Default)]
struct RecordingInstaller {
    calls: Mutex<Vec<String>>,
    fail: HashSet<String>,
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingInstaller {
    fn failing(names: &[&str]) -> Self {
        Self {
            fail: names.iter().map(|n| n.to_string()).collect(),
            ..Default::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| *c == name).count()
    }
}

impl NodeInstaller for RecordingInstaller {
    fn install(&self, job: &InstallJob<'_>) -> Result<()> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let name = job.node.name().to_string();
        self.calls.lock().unwrap().push(name.clone());

        // Every prerequisite keg must already be populated.
        for (dep, keg) in job.dependency_kegs {
            assert!(keg.join("lib").join(format!("lib{dep}.a")).is_file(), "{dep} missing for {name}");
        }
        thread::sleep(self.delay);
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.fail.contains(&name) {
            return Err(KilnError::InstallFailure(format!("{name} exploded")));
        }
        fs::create_dir_all(job.keg.join("lib"))?;
        fs::write(job.keg.join("lib").join(format!("lib{name}.a")), name.as_bytes())?;
        Ok(())
    }
}

fn registry(recipes: &[&str]) -> HashMap<String, Arc<Formula>> {
    recipes
        .iter()
        .map(|src| {
            let formula = Formula::load(src, "fixture").unwrap();
            (formula.name.clone(), Arc::new(formula))
        })
        .collect()
}

fn graph_for(reg: &HashMap<String, Arc<Formula>>, name: &str, flags: &[&str]) -> BuildGraph {
    let root = Arc::clone(&reg[name]);
    let options = resolve_options(&root, flags).options;
    build_graph(root, options, reg, &GraphOptions::default()).unwrap()
}

fn options(jobs: usize) -> OrchestratorOptions {
    OrchestratorOptions {
        jobs,
        build_from_source: false,
        run_tests: false,
        store_bottles: false,
        link: true,
    }
}

fn result_of<'a>(graph: &BuildGraph, report: &'a kiln_core::BuildReport, name: &str) -> &'a InstallResult {
    report.result(graph.find(name)[0])
}

fn chain() -> HashMap<String, Arc<Formula>> {
    registry(&[
        r#"{"name": "lib-a", "version": "1.0"}"#,
        r#"{"name": "lib-b", "version": "2.0", "dependencies": ["lib-a"]}"#,
        r#"{"name": "app", "version": "3.0", "dependencies": ["lib-b"]}"#,
    ])
}

#[test]
fn dependencies_install_before_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::with_root(dir.path());
    let installer = Arc::new(RecordingInstaller::default());
    let graph = graph_for(&chain(), "app", &[]);

    let report = Orchestrator::new(config.clone(), installer.clone())
        .with_options(options(4))
        .build(&graph);

    assert!(report.roots_ok());
    assert_eq!(report.success_count(), 3);
    assert_eq!(installer.calls(), vec!["lib-a", "lib-b", "app"]);
    assert!(config.formula_opt_path("app").join("lib/libapp.a").is_file());
}

#[test]
fn failure_blocks_dependents_without_invoking_them() {
    let dir = tempfile::tempdir().unwrap();
    let installer = Arc::new(RecordingInstaller::failing(&["lib-a"]));
    let graph = graph_for(&chain(), "app", &[]);

    let report = Orchestrator::new(Config::with_root(dir.path()), installer.clone())
        .with_options(options(2))
        .build(&graph);

    assert!(!report.roots_ok());
    assert_eq!(installer.calls(), vec!["lib-a"]);
    assert!(matches!(
        result_of(&graph, &report, "lib-a"),
        InstallResult::Failed(FailureReason::InstallFailure(msg)) if msg.contains("exploded")
    ));
    for name in ["lib-b", "app"] {
        assert_eq!(
            result_of(&graph, &report, name),
            &InstallResult::Failed(FailureReason::DependencyFailed("lib-a".into()))
        );
    }
    assert_eq!(report.fail_count(), 3);
    // No partial keg is left behind.
    assert!(!dir.path().join("Cellar/lib-a/1.0").exists());
}

#[test]
fn independent_branch_continues_after_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let reg = registry(&[
        r#"{"name": "broken", "version": "1"}"#,
        r#"{"name": "fine", "version": "1"}"#,
        r#"{"name": "uses-broken", "version": "1", "dependencies": ["broken"]}"#,
        r#"{"name": "uses-fine", "version": "1", "dependencies": ["fine"]}"#,
    ]);
    let roots = ["uses-broken", "uses-fine"]
        .iter()
        .map(|n| (Arc::clone(&reg[*n]), reg[*n].default_options()))
        .collect();
    let graph = build_graph_for_roots(roots, &reg, &GraphOptions::default()).unwrap();
    let installer = Arc::new(RecordingInstaller::failing(&["broken"]));

    let report = Orchestrator::new(Config::with_root(dir.path()), installer.clone())
        .with_options(options(1))
        .build(&graph);

    assert!(!report.roots_ok());
    assert!(result_of(&graph, &report, "uses-fine").is_ok());
    assert_eq!(installer.count("uses-broken"), 0);
    assert_eq!(installer.count("uses-fine"), 1);
}

#[test]
fn independent_nodes_fill_but_never_exceed_the_job_limit() {
    let dir = tempfile::tempdir().unwrap();
    let recipes: Vec<String> = (0..6)
        .map(|i| format!(r#"{{"name": "leaf-{i}", "version": "1"}}"#))
        .chain([r#"{"name": "top", "version": "1", "dependencies":
                  ["leaf-0", "leaf-1", "leaf-2", "leaf-3", "leaf-4", "leaf-5"]}"#
            .to_string()])
        .collect();
    let refs: Vec<&str> = recipes.iter().map(String::as_str).collect();
    let graph = graph_for(&registry(&refs), "top", &[]);
    let installer = Arc::new(RecordingInstaller::slow(Duration::from_millis(30)));

    let report = Orchestrator::new(Config::with_root(dir.path()), installer.clone())
        .with_options(options(2))
        .build(&graph);

    assert!(report.roots_ok());
    assert_eq!(installer.calls().len(), 7);
    // Six independent leaves keep both slots busy.
    assert_eq!(installer.peak.load(Ordering::SeqCst), 2);
    assert_eq!(installer.calls().last().map(String::as_str), Some("top"));
}

#[test]
fn cancellation_before_start_runs_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let installer = Arc::new(RecordingInstaller::default());
    let graph = graph_for(&chain(), "app", &[]);
    let orchestrator =
        Orchestrator::new(Config::with_root(dir.path()), installer.clone()).with_options(options(2));
    orchestrator.cancel();

    let report = orchestrator.build(&graph);
    assert!(installer.calls().is_empty());
    assert!(report
        .iter()
        .all(|(_, r)| *r == InstallResult::Failed(FailureReason::Cancelled)));
}

#[test]
fn cancellation_lets_running_installs_finish() {
    let dir = tempfile::tempdir().unwrap();
    let installer = Arc::new(RecordingInstaller::slow(Duration::from_millis(200)));
    let graph = graph_for(&chain(), "app", &[]);
    let orchestrator =
        Orchestrator::new(Config::with_root(dir.path()), installer.clone()).with_options(options(2));

    let handle = orchestrator.cancellation_handle();
    let watcher = {
        let installer = Arc::clone(&installer);
        thread::spawn(move || {
            while installer.calls().is_empty() {
                thread::sleep(Duration::from_millis(1));
            }
            handle.store(true, Ordering::SeqCst);
        })
    };
    let report = orchestrator.build(&graph);
    watcher.join().unwrap();

    assert_eq!(installer.calls(), vec!["lib-a".to_string()]);
    assert!(matches!(result_of(&graph, &report, "lib-a"), InstallResult::Success { .. }));
    for name in ["lib-b", "app"] {
        assert_eq!(
            *result_of(&graph, &report, name),
            InstallResult::Failed(FailureReason::Cancelled)
        );
    }
}

#[test]
fn second_run_skips_installed_kegs() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::with_root(dir.path());
    let graph = graph_for(&chain(), "app", &[]);

    let first = Arc::new(RecordingInstaller::default());
    Orchestrator::new(config.clone(), first.clone())
        .with_options(options(2))
        .build(&graph);

    let second = Arc::new(RecordingInstaller::default());
    let report = Orchestrator::new(config, second.clone())
        .with_options(options(2))
        .build(&graph);
    assert!(second.calls().is_empty());
    assert_eq!(report.skipped_count(), 3);
    assert!(matches!(
        result_of(&graph, &report, "app"),
        InstallResult::Skipped(SkipReason::AlreadyInstalled { .. })
    ));
}

#[test]
fn option_variants_get_separate_kegs() {
    let dir = tempfile::tempdir().unwrap();
    let reg = registry(&[r#"{"name": "tool", "version": "1", "options": [{"name": "with-debug"}]}"#]);
    let installer = Arc::new(RecordingInstaller::default());
    let config = Config::with_root(dir.path());
    let orchestrator = Orchestrator::new(config, installer.clone()).with_options(options(1));

    let plain = orchestrator.build(&graph_for(&reg, "tool", &[]));
    let debug = orchestrator.build(&graph_for(&reg, "tool", &["--with-debug"]));

    let plain_keg = plain.iter().next().unwrap().1.keg().unwrap().to_path_buf();
    let debug_keg = debug.iter().next().unwrap().1.keg().unwrap().to_path_buf();
    assert_ne!(plain_keg, debug_keg);
    assert_eq!(installer.count("tool"), 2);
}

#[test]
fn stored_bottles_are_poured_on_the_next_install() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::with_root(dir.path());
    let graph = graph_for(&chain(), "app", &[]);
    let mut opts = options(2);
    opts.store_bottles = true;

    let builder = Arc::new(RecordingInstaller::default());
    Orchestrator::new(config.clone(), builder.clone())
        .with_options(opts.clone())
        .build(&graph);
    assert_eq!(builder.calls().len(), 3);

    // Drop the kegs but keep the cache.
    fs::remove_dir_all(config.cellar_dir()).unwrap();
    fs::remove_dir_all(config.opt_dir()).unwrap();

    let (tx, mut rx) = broadcast::channel(64);
    let second = Arc::new(RecordingInstaller::default());
    let report = Orchestrator::new(config.clone(), second.clone())
        .with_options(opts)
        .with_events(tx)
        .build(&graph);

    assert!(second.calls().is_empty());
    assert!(matches!(
        result_of(&graph, &report, "lib-a"),
        InstallResult::Skipped(SkipReason::Bottle { .. })
    ));
    assert_eq!(
        fs::read(config.formula_opt_path("app").join("lib/libapp.a")).unwrap(),
        b"app"
    );
    let mut hits = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, PipelineEvent::CacheHit { .. }) {
            hits += 1;
        }
    }
    assert_eq!(hits, 3);
}

#[test]
fn tampered_cache_entry_is_evicted_and_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::with_root(dir.path());
    let reg = registry(&[r#"{"name": "lib-a", "version": "1.0"}"#]);
    let graph = graph_for(&reg, "lib-a", &[]);
    let mut opts = options(1);
    opts.store_bottles = true;

    let cache = Arc::new(BottleCache::from_config(&config));
    Orchestrator::new(config.clone(), Arc::new(RecordingInstaller::default()))
        .with_options(opts.clone())
        .with_cache(Arc::clone(&cache))
        .build(&graph);
    let entries = cache.entries().unwrap();
    assert_eq!(entries.len(), 1);
    let artifact = cache
        .root()
        .join(entries[0].key.digest())
        .join(&entries[0].file);
    fs::write(&artifact, b"not a bottle").unwrap();
    fs::remove_dir_all(config.cellar_dir()).unwrap();

    let (tx, mut rx) = broadcast::channel(64);
    let rebuild = Arc::new(RecordingInstaller::default());
    let report = Orchestrator::new(config, rebuild.clone())
        .with_options(opts)
        .with_cache(Arc::clone(&cache))
        .with_events(tx)
        .build(&graph);

    assert!(report.roots_ok());
    assert_eq!(rebuild.count("lib-a"), 1);
    let mut integrity_failures = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, PipelineEvent::IntegrityFailure { .. }) {
            integrity_failures += 1;
        }
    }
    assert_eq!(integrity_failures, 1);
    // The rebuild stored a fresh, valid entry.
    let entries = cache.entries().unwrap();
    let key: &BottleKey = &entries[0].key;
    assert!(cache.lookup(key).unwrap().is_some());
}

#[test]
fn build_from_source_ignores_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::with_root(dir.path());
    let reg = registry(&[r#"{"name": "lib-a", "version": "1.0"}"#]);
    let graph = graph_for(&reg, "lib-a", &[]);
    let mut opts = options(1);
    opts.store_bottles = true;

    Orchestrator::new(config.clone(), Arc::new(RecordingInstaller::default()))
        .with_options(opts.clone())
        .build(&graph);
    fs::remove_dir_all(config.cellar_dir()).unwrap();

    opts.build_from_source = true;
    let installer = Arc::new(RecordingInstaller::default());
    Orchestrator::new(config, installer.clone())
        .with_options(opts)
        .build(&graph);
    assert_eq!(installer.count("lib-a"), 1);
}

#[test]
fn events_bracket_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, mut rx) = broadcast::channel(64);
    let graph = graph_for(&chain(), "app", &[]);
    Orchestrator::new(Config::with_root(dir.path()), Arc::new(RecordingInstaller::default()))
        .with_options(options(2))
        .with_events(tx)
        .build(&graph);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(
        events.first(),
        Some(PipelineEvent::PipelineStarted { total_jobs: 3 })
    ));
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::PipelineFinished {
            success_count: 3,
            fail_count: 0,
            ..
        })
    ));
}

#[test]
fn keg_only_formulae_get_no_bin_links() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::with_root(dir.path());
    let reg = registry(&[r#"{"name": "hidden", "version": "1", "keg_only": "provided by the system"}"#]);

    struct BinInstaller;
    impl NodeInstaller for BinInstaller {
        fn install(&self, job: &InstallJob<'_>) -> Result<()> {
            fs::create_dir_all(job.keg.join("bin"))?;
            fs::write(job.keg.join("bin/hidden"), b"#!/bin/sh\n")?;
            Ok(())
        }
    }

    let report = Orchestrator::new(config.clone(), Arc::new(BinInstaller))
        .with_options(options(1))
        .build(&graph_for(&reg, "hidden", &[]));
    assert!(report.roots_ok());
    assert!(config.formula_opt_path("hidden").exists());
    assert!(!config.bin_dir().join("hidden").exists());
}
