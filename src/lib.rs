pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod durable;
pub mod error;
pub mod local;
pub mod logging;
pub mod orchestrator;
pub mod progress;
pub mod repair;
pub mod steps;

#[cfg(test)]
pub(crate) mod testing;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use error::{ClawupError, Result, StepFailure};
pub use orchestrator::{InstallRequest, InstallSummary, Orchestrator};
pub use progress::{ProgressBus, ProgressEvent, ProgressStatus};
pub use repair::{RepairReport, RepairRunner, RepairStepResult};
pub use steps::InstallStep;
