//! Ordered, checkpointed install runs.
//!
//! Each step is attempted once per run. Its checkpoint is written only after
//! the collaborator call settles, so a process killed mid-step resumes at that
//! same step on the next invocation.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::collaborators::{Collaborators, DiscoveredSecret, InstallMethod, PackageRequest, RuntimeInfo};
use crate::durable::DurableWriter;
use crate::error::{ClawupError, Result, StepFailure};
use crate::progress::{ProgressBus, ProgressEvent, ProgressStatus};
use crate::steps::InstallStep;

#[derive(Debug, Clone, PartialEq)]
pub struct InstallRequest {
    pub method: InstallMethod,
    pub package: String,
    pub version: String,
    /// Merged into the agent configuration during the `config` step.
    pub config_patch: serde_json::Value,
    pub secrets: Vec<DiscoveredSecret>,
}

impl Default for InstallRequest {
    fn default() -> Self {
        Self {
            method: InstallMethod::default(),
            package: "openclaw".to_string(),
            version: "latest".to_string(),
            config_patch: serde_json::json!({}),
            secrets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepWarning {
    pub step: InstallStep,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallSummary {
    pub resumed_from: Option<InstallStep>,
    pub steps_run: Vec<InstallStep>,
    pub warnings: Vec<StepWarning>,
    pub already_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReceipt {
    pub installed_at: DateTime<Utc>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_version: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Default)]
struct RunState {
    runtime: Option<RuntimeInfo>,
    package_version: Option<String>,
    warnings: Vec<StepWarning>,
}

pub struct Orchestrator<'a> {
    collaborators: &'a Collaborators,
    checkpoints: &'a CheckpointStore,
    progress: &'a ProgressBus,
    writer: DurableWriter,
    receipt_path: PathBuf,
    version: String,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        collaborators: &'a Collaborators,
        checkpoints: &'a CheckpointStore,
        progress: &'a ProgressBus,
        writer: DurableWriter,
        receipt_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            collaborators,
            checkpoints,
            progress,
            writer,
            receipt_path: receipt_path.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// First step the next run will execute, `None` when already installed.
    pub fn resume_point(&self) -> Result<Option<InstallStep>> {
        Ok(match self.checkpoints.get()? {
            Some(checkpoint) => checkpoint.resume_step(),
            None => Some(InstallStep::first()),
        })
    }

    pub fn install(&self, request: &InstallRequest) -> Result<InstallSummary> {
        let checkpoint = self.checkpoints.get()?;
        let resumed_from = checkpoint.as_ref().map(|checkpoint| checkpoint.step);
        let start = match &checkpoint {
            Some(checkpoint) => checkpoint.resume_step(),
            None => Some(InstallStep::first()),
        };

        let Some(start) = start else {
            info!("installation already complete");
            self.emit(
                InstallStep::Complete,
                ProgressStatus::Completed,
                "installation already complete",
            );
            return Ok(InstallSummary {
                resumed_from,
                steps_run: Vec::new(),
                warnings: Vec::new(),
                already_complete: true,
            });
        };
        if let Some(previous) = resumed_from {
            info!(checkpoint = %previous, resume_at = %start, "resuming installation");
        }

        let mut state = RunState::default();
        let mut steps_run = Vec::new();
        for &step in start.remaining() {
            self.emit(step, ProgressStatus::Running, describe(step));
            steps_run.push(step);
            match self.execute(step, request, &mut state) {
                Ok(message) => {
                    self.checkpoint(step, None)?;
                    self.emit(step, ProgressStatus::Completed, message);
                }
                Err(failure) => {
                    self.checkpoint(step, Some(&failure.message))?;
                    self.emit(step, ProgressStatus::Failed, failure.message.clone());
                    if failure.critical {
                        return Err(ClawupError::Step(failure));
                    }
                    warn!(step = %step, "continuing past non-critical failure: {}", failure.message);
                    state.warnings.push(StepWarning {
                        step,
                        message: failure.message,
                    });
                }
            }
        }

        Ok(InstallSummary {
            resumed_from,
            steps_run,
            warnings: state.warnings,
            already_complete: false,
        })
    }

    /// Persist the checkpoint for `step`. A failed write still closes the
    /// step with a `failed` event before the error propagates.
    fn checkpoint(&self, step: InstallStep, error: Option<&str>) -> Result<()> {
        if let Err(err) = self.checkpoints.write(step, error) {
            self.emit(step, ProgressStatus::Failed, err.to_string());
            return Err(err);
        }
        Ok(())
    }

    fn emit(&self, step: InstallStep, status: ProgressStatus, message: impl Into<String>) {
        self.progress.emit(ProgressEvent::new(step, status, message));
    }

    fn execute(
        &self,
        step: InstallStep,
        request: &InstallRequest,
        state: &mut RunState,
    ) -> Result<String, StepFailure> {
        let outcome = match step {
            InstallStep::Runtime => self.resolve_runtime(state),
            InstallStep::Openclaw => self.install_package(request, state),
            InstallStep::Config => self.compile_config(request),
            InstallStep::Credentials => self.store_credentials(request),
            InstallStep::Daemon => self.start_daemon(),
            InstallStep::Health => self.check_health(),
            InstallStep::Complete => self.finish(state),
        };
        outcome.map_err(|err| StepFailure::new(step, err.to_string()))
    }

    fn resolve_runtime(&self, state: &mut RunState) -> Result<String> {
        let runtime = self.collaborators.runtime.resolve()?;
        if !runtime.verified {
            return Err(ClawupError::Process(format!(
                "runtime at {} (version {}) failed integrity verification",
                runtime.path.display(),
                runtime.version
            )));
        }
        let message = format!(
            "runtime {} ready at {}",
            runtime.version,
            runtime.path.display()
        );
        state.runtime = Some(runtime);
        Ok(message)
    }

    fn install_package(&self, request: &InstallRequest, state: &mut RunState) -> Result<String> {
        let package = PackageRequest {
            method: request.method,
            package: request.package.clone(),
            version: request.version.clone(),
            runtime: state.runtime.clone(),
        };
        let mut forward = |line: &str| {
            self.emit(InstallStep::Openclaw, ProgressStatus::Running, line);
        };
        let installed = self
            .collaborators
            .installer
            .install(&package, &mut forward)?;
        let message = match &installed {
            Some(version) => format!("{} {} installed", package.package, version),
            None => format!(
                "{} installed via {}",
                package.package,
                package.method.as_str()
            ),
        };
        state.package_version = installed;
        Ok(message)
    }

    fn compile_config(&self, request: &InstallRequest) -> Result<String> {
        let current = self.collaborators.config.get_current_config()?;
        if json_contains(&current, &request.config_patch) {
            return Ok("configuration already up to date".to_string());
        }
        self.collaborators.config.apply(&request.config_patch)?;
        Ok("configuration applied".to_string())
    }

    fn store_credentials(&self, request: &InstallRequest) -> Result<String> {
        for secret in &request.secrets {
            self.collaborators
                .credentials
                .store(&secret.service, &secret.key, &secret.value)?;
        }
        Ok(match request.secrets.len() {
            0 => "no credentials discovered".to_string(),
            1 => "stored 1 credential".to_string(),
            n => format!("stored {n} credentials"),
        })
    }

    fn start_daemon(&self) -> Result<String> {
        let daemon = &self.collaborators.daemon;
        if daemon.status()?.running {
            daemon.restart()?;
        } else {
            daemon.install_service()?;
            if let Err(err) = daemon.start() {
                // Leave no service registration behind for a daemon that never started.
                if let Err(cleanup) = daemon.uninstall_service() {
                    warn!("failed to remove service registration: {cleanup}");
                }
                return Err(err);
            }
        }
        let status = daemon.status()?;
        if !status.running {
            return Err(ClawupError::Process(
                "daemon is not running after start".to_string(),
            ));
        }
        Ok(match status.pid {
            Some(pid) => format!("daemon running (pid {pid})"),
            None => "daemon running".to_string(),
        })
    }

    fn check_health(&self) -> Result<String> {
        if self.collaborators.health.evaluate()? {
            Ok("gateway is healthy".to_string())
        } else {
            Err(ClawupError::Process(
                "gateway did not pass health evaluation".to_string(),
            ))
        }
    }

    fn finish(&self, state: &RunState) -> Result<String> {
        let receipt = InstallReceipt {
            installed_at: Utc::now(),
            version: self.version.clone(),
            runtime_version: state.runtime.as_ref().map(|runtime| runtime.version.clone()),
            package_version: state.package_version.clone(),
            warnings: state
                .warnings
                .iter()
                .map(|warning| format!("{}: {}", warning.step, warning.message))
                .collect(),
        };
        let body = serde_json::to_string_pretty(&receipt)?;
        self.writer.write(&self.receipt_path, format!("{body}\n"))?;
        Ok(completion_message(&state.warnings))
    }
}

fn describe(step: InstallStep) -> &'static str {
    match step {
        InstallStep::Runtime => "resolving runtime",
        InstallStep::Openclaw => "installing agent package",
        InstallStep::Config => "compiling configuration",
        InstallStep::Credentials => "storing credentials",
        InstallStep::Daemon => "starting daemon",
        InstallStep::Health => "checking gateway health",
        InstallStep::Complete => "finalizing installation",
    }
}

fn completion_message(warnings: &[StepWarning]) -> String {
    if warnings.is_empty() {
        return "installation complete".to_string();
    }
    let listed: Vec<String> = warnings
        .iter()
        .map(|warning| format!("{}: {}", warning.step, warning.message))
        .collect();
    format!("installation complete with warnings: {}", listed.join("; "))
}

/// True when every field of `patch` is already present in `current` with the same value.
fn json_contains(current: &serde_json::Value, patch: &serde_json::Value) -> bool {
    match (current, patch) {
        (serde_json::Value::Object(current), serde_json::Value::Object(patch)) => {
            patch.iter().all(|(key, value)| {
                current
                    .get(key)
                    .is_some_and(|existing| json_contains(existing, value))
            })
        }
        (current, patch) => current == patch,
    }
}
