use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::steps::InstallStep;

pub type Result<T, E = ClawupError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ClawupError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("could not lock {} after {attempts} attempts: {source}", path.display())]
    Lock {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: Box<ClawupError>,
    },
    #[error("atomic rename {} -> {} failed: {source}", from.display(), to.display())]
    AtomicRename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("permission denied: {}", path.display())]
    PermissionDenied { path: PathBuf },
    #[error("checkpoint {} is corrupt: {reason}", path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },
    #[error(transparent)]
    Step(#[from] StepFailure),
}

/// Outcome of a failed install step. `critical` decides whether the run
/// aborts or carries on with the next step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("step `{step}` failed: {message}")]
pub struct StepFailure {
    pub step: InstallStep,
    pub critical: bool,
    pub message: String,
}

impl StepFailure {
    pub fn new(step: InstallStep, message: impl Into<String>) -> Self {
        Self {
            step,
            critical: step.is_critical(),
            message: message.into(),
        }
    }
}

impl ClawupError {
    pub(crate) fn write(path: impl Into<PathBuf>, source: ClawupError) -> Self {
        ClawupError::Write {
            path: path.into(),
            source: Box::new(source),
        }
    }

    pub fn is_lock(&self) -> bool {
        matches!(self, ClawupError::Lock { .. })
    }
}
