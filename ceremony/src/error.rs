use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::sequencer::Stage;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid circuit reference {path}: {reason}")]
    InvalidCircuit { path: PathBuf, reason: String },
    #[error("invalid ceremony exponent {input:?}: {reason}")]
    InvalidPower { input: String, reason: String },
    #[error("invalid beacon parameters: {0}")]
    InvalidBeacon(String),
    #[error("required tool `{program}` not found on PATH (needed by {needed_by})")]
    MissingTool {
        program: String,
        needed_by: &'static str,
    },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{stage} stage failed: {source}")]
    Tool {
        stage: Stage,
        #[source]
        source: GatewayError,
    },
    #[error(
        "{stage} stage: verification of {} failed: {source}. Contributed entropy cannot be retracted; \
         delete the stage's intermediate files and restart the ceremony from scratch",
        artifact.display()
    )]
    Verification {
        stage: Stage,
        artifact: PathBuf,
        #[source]
        source: GatewayError,
    },
    #[error("{stage} stage cannot start: prerequisite {} is missing", artifact.display())]
    MissingPrerequisite { stage: Stage, artifact: PathBuf },
    #[error("no response appeared at {} within {waited_secs}s", path.display())]
    ResponseTimeout { path: PathBuf, waited_secs: u64 },
    #[error("refusing to clean up before {} exists and is verified", terminal.display())]
    CleanupBeforeVerification { terminal: PathBuf },
    #[error("{stage} stage produced an unusable artifact {}: {reason}", artifact.display())]
    Malformed {
        stage: Stage,
        artifact: PathBuf,
        reason: String,
    },
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the pipeline refused to start rather than failing mid-run.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidCircuit { .. }
                | PipelineError::InvalidPower { .. }
                | PipelineError::InvalidBeacon(_)
                | PipelineError::MissingTool { .. }
                | PipelineError::Config(_)
        )
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
