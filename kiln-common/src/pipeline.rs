// kiln-common/src/pipeline.rs
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::KilnError;

/// A verified precompiled artifact in the bottle cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Cache key digest the artifact is stored under.
    pub digest: String,
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Source build skipped: a verified bottle was poured into the keg.
    Bottle { artifact: ArtifactRef, keg: PathBuf },
    /// The keg already holds an install of this exact node.
    AlreadyInstalled { keg: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    InstallFailure(String),
    /// Names the failed prerequisite the failure originated from.
    DependencyFailed(String),
    Cancelled,
}

impl FailureReason {
    pub fn to_error(&self) -> KilnError {
        match self {
            Self::InstallFailure(msg) => KilnError::InstallFailure(msg.clone()),
            Self::DependencyFailed(dep) => KilnError::DependencyFailed(dep.clone()),
            Self::Cancelled => KilnError::Cancelled,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstallFailure(msg) => write!(f, "{msg}"),
            Self::DependencyFailed(dep) => write!(f, "dependency '{dep}' failed"),
            Self::Cancelled => write!(f, "cancelled before start"),
        }
    }
}

/// Terminal state of one build node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallResult {
    Success { keg: PathBuf },
    Skipped(SkipReason),
    Failed(FailureReason),
}

impl InstallResult {
    /// Success or skipped: dependents may proceed.
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    pub fn keg(&self) -> Option<&Path> {
        match self {
            Self::Success { keg }
            | Self::Skipped(SkipReason::Bottle { keg, .. })
            | Self::Skipped(SkipReason::AlreadyInstalled { keg }) => Some(keg),
            Self::Failed(_) => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Skipped(SkipReason::Bottle { .. }) => "skipped (bottle)",
            Self::Skipped(SkipReason::AlreadyInstalled { .. }) => "skipped (installed)",
            Self::Failed(FailureReason::DependencyFailed(_)) => "failed (dependency)",
            Self::Failed(FailureReason::Cancelled) => "failed (cancelled)",
            Self::Failed(FailureReason::InstallFailure(_)) => "failed",
        }
    }
}

/// Coordinator-side state of a node during orchestration.
#[derive(Debug, Clone)]
pub enum JobProcessingState {
    /// Prerequisites not yet terminal.
    WaitingForDependencies,
    /// All prerequisites terminal and ok; waiting for a free worker slot.
    Ready,
    /// Handed to the worker pool.
    DispatchedToCore,
    Finished(InstallResult),
}

impl JobProcessingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        total_jobs: usize,
    },
    PipelineFinished {
        duration_secs: f64,
        success_count: usize,
        skipped_count: usize,
        fail_count: usize,
    },
    OptionWarning {
        message: String,
    },
    JobDispatchedToCore {
        target_id: String,
    },
    JobProcessingStarted {
        target_id: String,
    },
    CacheHit {
        target_id: String,
        digest: String,
    },
    DownloadStarted {
        target_id: String,
        url: String,
    },
    DownloadFinished {
        target_id: String,
        path: PathBuf,
        size_bytes: u64,
    },
    IntegrityFailure {
        target_id: String,
        error: String,
    },
    BuildStarted {
        target_id: String,
    },
    StepStarted {
        target_id: String,
        step: String,
    },
    LinkStarted {
        target_id: String,
    },
    JobSuccess {
        target_id: String,
        keg: PathBuf,
    },
    JobSkipped {
        target_id: String,
        reason: String,
    },
    JobFailed {
        target_id: String,
        error: String,
    },
    LogInfo {
        message: String,
    },
    LogWarn {
        message: String,
    },
    LogError {
        message: String,
    },
}

impl PipelineEvent {
    pub fn job_failed(target_id: String, error: &KilnError) -> Self {
        PipelineEvent::JobFailed {
            target_id,
            error: error.to_string(),
        }
    }

    /// Event announcing a node's terminal result.
    pub fn for_result(target_id: String, result: &InstallResult) -> Self {
        match result {
            InstallResult::Success { keg } => PipelineEvent::JobSuccess {
                target_id,
                keg: keg.clone(),
            },
            InstallResult::Skipped(SkipReason::Bottle { artifact, .. }) => {
                PipelineEvent::JobSkipped {
                    target_id,
                    reason: format!("poured bottle {}", &artifact.digest[..12.min(artifact.digest.len())]),
                }
            }
            InstallResult::Skipped(SkipReason::AlreadyInstalled { keg }) => {
                PipelineEvent::JobSkipped {
                    target_id,
                    reason: format!("already installed in {}", keg.display()),
                }
            }
            InstallResult::Failed(reason) => PipelineEvent::JobFailed {
                target_id,
                error: reason.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_failures_block_dependents() {
        let ok = InstallResult::Success {
            keg: PathBuf::from("/k/Cellar/a/1"),
        };
        let skipped = InstallResult::Skipped(SkipReason::AlreadyInstalled {
            keg: PathBuf::from("/k/Cellar/a/1"),
        });
        let failed = InstallResult::Failed(FailureReason::DependencyFailed("a".into()));
        assert!(ok.is_ok() && skipped.is_ok() && !failed.is_ok());
        assert_eq!(skipped.keg(), Some(Path::new("/k/Cellar/a/1")));
        assert!(matches!(
            FailureReason::DependencyFailed("a".into()).to_error(),
            KilnError::DependencyFailed(ref d) if d == "a"
        ));
        assert!(matches!(
            PipelineEvent::for_result("b".into(), &failed),
            PipelineEvent::JobFailed { ref error, .. } if error.contains("'a'")
        ));
    }
}
