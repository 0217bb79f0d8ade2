use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::Serialize;

use crate::artifact::{Artifact, Retention};
use crate::error::{PipelineError, PipelineResult};
use crate::store::ArtifactStore;

/// Deletes a stage's intermediates once its terminal artifact is in place.
///
/// The sequencer only calls this after the terminal artifact passed
/// verification and was promoted; a failed ceremony keeps every intermediate
/// for inspection.
#[derive(Clone, Copy, Debug, Default)]
pub struct CleanupPolicy {
    pub keep_intermediates: bool,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kept: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<FailedRemoval>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FailedRemoval {
    pub path: PathBuf,
    pub error: String,
}

impl CleanupPolicy {
    pub fn new(keep_intermediates: bool) -> Self {
        Self { keep_intermediates }
    }

    pub fn sweep<S: ArtifactStore>(
        &self,
        store: &S,
        terminal: &Path,
        intermediates: &[Artifact],
    ) -> PipelineResult<CleanupReport> {
        if !store.exists(terminal) {
            return Err(PipelineError::CleanupBeforeVerification {
                terminal: terminal.to_path_buf(),
            });
        }

        let mut report = CleanupReport::default();
        for artifact in intermediates {
            if artifact.retention == Retention::Final || artifact.path == terminal {
                continue;
            }
            if !store.exists(&artifact.path) {
                continue;
            }
            if self.keep_intermediates {
                debug!("Keeping intermediate {}", artifact.path.display());
                report.kept.push(artifact.path.clone());
                continue;
            }
            match store.remove(&artifact.path) {
                Ok(()) => {
                    debug!("Removed intermediate {}", artifact.path.display());
                    report.removed.push(artifact.path.clone());
                }
                Err(err) => {
                    warn!(
                        "Could not remove intermediate {}: {}",
                        artifact.path.display(),
                        err
                    );
                    report.failed.push(FailedRemoval {
                        path: artifact.path.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            "Cleanup after {}: {} removed, {} kept, {} failed",
            terminal.display(),
            report.removed.len(),
            report.kept.len(),
            report.failed.len()
        );
        Ok(report)
    }
}
