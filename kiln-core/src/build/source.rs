// kiln-core/src/build/source.rs
use kiln_common::error::{KilnError, Result};
use kiln_common::pipeline::PipelineEvent;
use tracing::{debug, info, instrument};

use super::env::BuildEnvironment;
use super::sandbox::BuildSandbox;
use super::steps::StepRunner;
use super::{InstallJob, NodeInstaller};
use crate::fetch;
use crate::install::extract::{extract_archive, infer_archive_root_dir};

/// Fetches, verifies and unpacks a formula's source archive, then runs its
/// install steps (and test steps when requested) inside a throwaway build
/// directory.
#[derive(Debug, Default, Clone)]
pub struct SourceInstaller;

impl SourceInstaller {
    pub fn new() -> Self {
        Self
    }
}

impl NodeInstaller for SourceInstaller {
    #[instrument(skip_all, fields(node = %job.node))]
    fn install(&self, job: &InstallJob<'_>) -> Result<()> {
        let formula = &job.node.formula;
        let target_id = job.node.name().to_string();
        let sandbox = BuildSandbox::new_in(&job.config.tmp_dir(), &formula.name)?;

        if !formula.url.is_empty() {
            job.send(PipelineEvent::DownloadStarted {
                target_id: target_id.clone(),
                url: formula.url.clone(),
            });
            let archive = fetch::fetch_source(
                &formula.name,
                &formula.url,
                &formula.sha256,
                &formula.mirrors,
                job.config,
            )?;
            let size_bytes = archive.metadata().map(|m| m.len()).unwrap_or(0);
            job.send(PipelineEvent::DownloadFinished {
                target_id: target_id.clone(),
                path: archive.clone(),
                size_bytes,
            });
            let strip = usize::from(infer_archive_root_dir(&archive)?.is_some());
            extract_archive(&archive, sandbox.path(), strip)?;
        } else {
            debug!("{} has no source archive; running steps only", formula.name);
        }

        let env = BuildEnvironment::new(
            job.node,
            job.keg,
            sandbox.path(),
            job.dependency_kegs,
            job.config,
        )?;
        let log_path = job
            .config
            .node_log_path(&formula.name)
            .join(format!("{}.log", job.node.short_identity()));
        info!("Building {} (log: {})", job.node, log_path.display());
        job.send(PipelineEvent::BuildStarted {
            target_id: target_id.clone(),
        });

        let mut runner = StepRunner::new(&env, &job.node.options, Some(&log_path))?;
        let ran = runner.run_all(&formula.install, |step| {
            job.send(PipelineEvent::StepStarted {
                target_id: target_id.clone(),
                step: step.describe(),
            });
        })?;
        if ran == 0 {
            return Err(KilnError::InstallFailure(format!(
                "{} has no active install steps",
                formula.name
            )));
        }

        if job.run_tests && !formula.test.is_empty() {
            debug!("Running {} test step(s) for {}", formula.test.len(), formula.name);
            runner
                .run_all(&formula.test, |_| {})
                .map_err(|e| KilnError::InstallFailure(format!("test failed: {e}")))?;
        }
        Ok(())
    }
}
