// kiln/src/pipeline/runner.rs
use std::sync::atomic::Ordering;
use std::sync::Arc;

use colored::Colorize;
use kiln_common::config::Config;
use kiln_common::dependency::{build_graph_for_roots, BuildGraph, GraphOptions};
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::model::{resolve_options, Formula, OptionSet};
use kiln_common::pipeline::{InstallResult, PipelineEvent};
use kiln_core::{BuildReport, Orchestrator, OrchestratorOptions, SourceInstaller};
use prettytable::{format, Cell, Row, Table};
use tokio::sync::broadcast;
use tracing::{debug, error, instrument, warn};

const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, Clone)]
pub struct PipelineFlags {
    pub build_from_source: bool,
    pub run_tests: bool,
    pub store_bottles: bool,
}

/// Loads every requested formula and resolves `option_flags` against each.
/// Unknown flags are reported, never fatal.
pub fn resolve_roots(
    formulary: &Formulary,
    names: &[String],
    option_flags: &[String],
) -> Result<(Vec<(Arc<Formula>, OptionSet)>, Vec<String>)> {
    let mut roots = Vec::new();
    let mut warnings = Vec::new();
    for name in names {
        let formula = formulary.load_formula(name)?;
        let resolved = resolve_options(&formula, option_flags);
        for warning in &resolved.warnings {
            warn!("{}", warning);
            warnings.push(warning.to_string());
        }
        roots.push((formula, resolved.options));
    }
    Ok((roots, warnings))
}

/// Resolves the requested formulas into one build graph.
pub fn plan_graph(
    config: &Config,
    names: &[String],
    option_flags: &[String],
    include_test: bool,
) -> Result<(BuildGraph, Vec<String>)> {
    if names.is_empty() {
        return Err(KilnError::Generic(
            "No formula names given (build options alone are not enough)".to_string(),
        ));
    }
    let formulary = Formulary::new(config);
    let (roots, mut warnings) = resolve_roots(&formulary, names, option_flags)?;
    let graph = build_graph_for_roots(
        roots,
        &formulary,
        &GraphOptions {
            settings: config.build_settings(),
            include_test,
        },
    )?;
    for warning in graph.warnings() {
        warn!("{}", warning);
        warnings.push(warning.to_string());
    }
    debug!("Planned {} node(s) for {:?}", graph.len(), names);
    Ok((graph, warnings))
}

#[instrument(skip_all, fields(targets = ?names))]
pub async fn run_pipeline(
    names: &[String],
    option_flags: &[String],
    config: &Config,
    flags: &PipelineFlags,
) -> Result<()> {
    let (graph, warnings) = plan_graph(config, names, option_flags, flags.run_tests)?;
    let graph = Arc::new(graph);

    let (event_tx, _) = broadcast::channel::<PipelineEvent>(EVENT_CHANNEL_SIZE);
    let status_handle = tokio::spawn(crate::cli::status::handle_events(event_tx.subscribe()));
    for message in warnings {
        let _ = event_tx.send(PipelineEvent::OptionWarning { message });
    }

    let mut options = OrchestratorOptions::from_config(config);
    options.build_from_source = flags.build_from_source;
    options.run_tests = flags.run_tests;
    options.store_bottles = flags.store_bottles;

    let orchestrator = Orchestrator::new(config.clone(), Arc::new(SourceInstaller::new()))
        .with_options(options)
        .with_events(event_tx.clone());

    let cancel = orchestrator.cancellation_handle();
    let signal_tx = event_tx.clone();
    let signal_handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.store(true, Ordering::SeqCst);
            let _ = signal_tx.send(PipelineEvent::LogWarn {
                message: "Interrupted: waiting for running installs to finish".to_string(),
            });
        }
    });

    let build_graph = Arc::clone(&graph);
    let report = tokio::task::spawn_blocking(move || orchestrator.build(&build_graph))
        .await
        .map_err(|e| KilnError::Generic(format!("Orchestrator task failed: {e}")))?;
    signal_handle.abort();
    drop(event_tx);

    if let Err(e) = status_handle.await {
        error!("Status handler task failed: {}", e);
    }

    print_summary(&graph, &report);

    if report.roots_ok() {
        Ok(())
    } else {
        let failed: Vec<&str> = report
            .roots()
            .iter()
            .filter(|r| !report.result(**r).is_ok())
            .map(|r| graph.node(*r).name())
            .collect();
        Err(KilnError::InstallFailure(format!(
            "{} requested formula(s) did not install: {}",
            failed.len(),
            failed.join(", ")
        )))
    }
}

fn print_summary(graph: &BuildGraph, report: &BuildReport) {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
    table.add_row(Row::new(vec![
        Cell::new("Formula").style_spec("b"),
        Cell::new("Options").style_spec("b"),
        Cell::new("Result").style_spec("b"),
        Cell::new("Detail").style_spec("b"),
    ]));
    for (id, result) in report.iter() {
        let node = graph.node(id);
        let (style, detail) = match result {
            InstallResult::Success { keg } => ("Fg", keg.display().to_string()),
            InstallResult::Skipped(_) => ("Fc", result.keg().map(|k| k.display().to_string()).unwrap_or_default()),
            InstallResult::Failed(reason) => ("Fr", first_line(&reason.to_string())),
        };
        let name = if graph.is_root(id) {
            node.name().bold().to_string()
        } else {
            node.name().to_string()
        };
        table.add_row(Row::new(vec![
            Cell::new(&name),
            Cell::new(&node.options.to_string()),
            Cell::new(result.label()).style_spec(style),
            Cell::new(&detail),
        ]));
    }
    println!();
    table.printstd();
    println!(
        "{} {} installed, {} skipped, {} failed in {:.2}s",
        "==>".bold().blue(),
        report.success_count(),
        report.skipped_count(),
        report.fail_count(),
        report.duration.as_secs_f64()
    );
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn config_with(recipes: &[(&str, &str)]) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_root(dir.path());
        let formula_dir = &config.formula_dirs[0];
        fs::create_dir_all(formula_dir).unwrap();
        for (name, body) in recipes {
            fs::write(formula_dir.join(format!("{name}.json")), body).unwrap();
        }
        (dir, config)
    }

    #[test]
    fn plans_shared_dependencies_once() {
        let (_dir, config) = config_with(&[
            ("zlib", r#"{"name": "zlib", "version": "1.3"}"#),
            ("png", r#"{"name": "png", "version": "1.6", "dependencies": ["zlib"]}"#),
            ("tiff", r#"{"name": "tiff", "version": "4.6", "dependencies": ["zlib"]}"#),
        ]);
        let (graph, warnings) =
            plan_graph(&config, &["png".into(), "tiff".into()], &[], false).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.roots().len(), 2);
        assert!(warnings.is_empty());
    }

    #[test]
    fn unknown_options_become_warnings() {
        let (_dir, config) = config_with(&[("zlib", r#"{"name": "zlib", "version": "1.3"}"#)]);
        let (graph, warnings) =
            plan_graph(&config, &["zlib".into()], &["--with-nothing".into()], false).unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("with-nothing"));
    }

    #[test]
    fn missing_formula_fails_before_any_install() {
        let (_dir, config) = config_with(&[]);
        assert!(plan_graph(&config, &["ghost".into()], &[], false).is_err());
        assert!(plan_graph(&config, &[], &["--with-x".into()], false).is_err());
    }
}
