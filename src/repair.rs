use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checkpoint::CheckpointStore;
use crate::collaborators::Collaborators;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairStepResult {
    pub step: String,
    pub passed: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub overall_success: bool,
    pub steps: Vec<RepairStepResult>,
    pub completed_at: DateTime<Utc>,
}

impl RepairReport {
    pub fn failures(&self) -> impl Iterator<Item = &RepairStepResult> {
        self.steps.iter().filter(|step| !step.passed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepairCheck {
    Checkpoint,
    Runtime,
    Config,
    Daemon,
    Health,
    AutoFix,
    Summary,
}

impl RepairCheck {
    const ALL: [RepairCheck; 7] = [
        RepairCheck::Checkpoint,
        RepairCheck::Runtime,
        RepairCheck::Config,
        RepairCheck::Daemon,
        RepairCheck::Health,
        RepairCheck::AutoFix,
        RepairCheck::Summary,
    ];

    fn id(self) -> &'static str {
        match self {
            RepairCheck::Checkpoint => "checkpoint_file",
            RepairCheck::Runtime => "runtime_binary",
            RepairCheck::Config => "agent_config",
            RepairCheck::Daemon => "daemon_process",
            RepairCheck::Health => "gateway_health",
            RepairCheck::AutoFix => "auto_fix",
            RepairCheck::Summary => "summary",
        }
    }

    fn remediation(self) -> &'static str {
        match self {
            RepairCheck::Checkpoint => "Run `clawup install` to rebuild the install checkpoint.",
            RepairCheck::Runtime => {
                "Install a supported runtime (see `runtime.min_major`) and rerun `clawup install`."
            }
            RepairCheck::Config => "Rerun `clawup install` to recompile the agent configuration.",
            RepairCheck::Daemon => "Run `clawup daemon restart` and check the daemon log.",
            RepairCheck::Health => "Check that the gateway port is free and the daemon log is clean.",
            RepairCheck::AutoFix => "Fix the reported problems manually, then rerun `clawup repair`.",
            RepairCheck::Summary => "",
        }
    }
}

/// Number of checks every repair run reports.
pub const REPAIR_CHECK_COUNT: usize = RepairCheck::ALL.len();

fn check_result(
    check: RepairCheck,
    passed: bool,
    message: impl Into<String>,
) -> RepairStepResult {
    RepairStepResult {
        step: check.id().to_string(),
        passed,
        message: message.into(),
        suggested_action: (!passed).then(|| check.remediation().to_string()),
    }
}

pub struct RepairRunner<'a> {
    collaborators: &'a Collaborators,
    checkpoints: &'a CheckpointStore,
    max_failures: usize,
}

impl<'a> RepairRunner<'a> {
    pub fn new(
        collaborators: &'a Collaborators,
        checkpoints: &'a CheckpointStore,
        max_failures: usize,
    ) -> Self {
        Self {
            collaborators,
            checkpoints,
            max_failures,
        }
    }

    /// Run every check in order. Never fails: a check that errors is
    /// reported as a failed result.
    pub fn repair(&self) -> RepairReport {
        let started = Instant::now();
        let mut steps: Vec<RepairStepResult> = Vec::with_capacity(REPAIR_CHECK_COUNT);
        for check in RepairCheck::ALL {
            let result = self
                .run_check(check, &steps, started)
                .unwrap_or_else(|err| {
                    warn!(check = check.id(), "repair check errored: {err}");
                    check_result(check, false, err.to_string())
                });
            steps.push(result);
        }

        let failed = steps.iter().filter(|step| !step.passed).count();
        let overall_success = failed <= self.max_failures;
        info!(failed, overall_success, "repair finished");
        RepairReport {
            overall_success,
            steps,
            completed_at: Utc::now(),
        }
    }

    fn run_check(
        &self,
        check: RepairCheck,
        earlier: &[RepairStepResult],
        started: Instant,
    ) -> Result<RepairStepResult> {
        match check {
            RepairCheck::Checkpoint => self.check_checkpoint(),
            RepairCheck::Runtime => {
                let runtime = self.collaborators.runtime.resolve()?;
                Ok(check_result(
                    check,
                    runtime.verified,
                    if runtime.verified {
                        format!("runtime {} verified at {}", runtime.version, runtime.path.display())
                    } else {
                        format!(
                            "runtime {} at {} failed verification",
                            runtime.version,
                            runtime.path.display()
                        )
                    },
                ))
            }
            RepairCheck::Config => {
                let config = self.collaborators.config.get_current_config()?;
                let keys = config.as_object().map_or(0, |object| object.len());
                Ok(check_result(
                    check,
                    keys > 0,
                    if keys > 0 {
                        format!("agent configuration readable ({keys} top-level keys)")
                    } else {
                        "agent configuration is empty".to_string()
                    },
                ))
            }
            RepairCheck::Daemon => {
                let status = self.collaborators.daemon.status()?;
                Ok(check_result(
                    check,
                    status.running,
                    match (status.running, status.pid) {
                        (true, Some(pid)) => format!("daemon running (pid {pid})"),
                        (true, None) => "daemon running".to_string(),
                        (false, _) => "daemon is not running".to_string(),
                    },
                ))
            }
            RepairCheck::Health => {
                let health = &self.collaborators.health;
                if !health.is_running()? {
                    return Ok(check_result(check, false, "gateway process is not running"));
                }
                let healthy = health.evaluate()?;
                Ok(check_result(
                    check,
                    healthy,
                    if healthy {
                        "gateway is healthy"
                    } else {
                        "gateway failed health evaluation"
                    },
                ))
            }
            RepairCheck::AutoFix => self.auto_fix(earlier),
            RepairCheck::Summary => {
                let passed = earlier.iter().filter(|step| step.passed).count();
                Ok(check_result(
                    check,
                    true,
                    format!(
                        "{passed} of {} checks passed in {:.1}s",
                        earlier.len(),
                        started.elapsed().as_secs_f64()
                    ),
                ))
            }
        }
    }

    fn check_checkpoint(&self) -> Result<RepairStepResult> {
        let check = RepairCheck::Checkpoint;
        Ok(match self.checkpoints.load()? {
            None => check_result(check, false, "no install checkpoint found"),
            Some(checkpoint) => match &checkpoint.error {
                Some(error) => RepairStepResult {
                    suggested_action: Some(format!(
                        "Rerun `clawup install` to retry from `{}`.",
                        checkpoint.step
                    )),
                    ..check_result(
                        check,
                        false,
                        format!("step `{}` failed: {error}", checkpoint.step),
                    )
                },
                None => check_result(
                    check,
                    true,
                    format!(
                        "last step `{}` recorded at {}",
                        checkpoint.step,
                        checkpoint.completed_at.to_rfc3339()
                    ),
                ),
            },
        })
    }

    fn auto_fix(&self, earlier: &[RepairStepResult]) -> Result<RepairStepResult> {
        let check = RepairCheck::AutoFix;
        let failed: Vec<&str> = earlier
            .iter()
            .filter(|step| !step.passed)
            .map(|step| step.step.as_str())
            .collect();
        if failed.is_empty() {
            return Ok(check_result(check, true, "nothing to fix"));
        }

        let mut notes = Vec::new();
        if failed.contains(&RepairCheck::Daemon.id()) {
            info!("restarting daemon");
            self.collaborators.daemon.restart()?;
            notes.push("daemon restarted".to_string());
        }
        let manual: Vec<&str> = failed
            .iter()
            .copied()
            .filter(|id| *id != RepairCheck::Daemon.id())
            .collect();
        if manual.is_empty() {
            return Ok(check_result(check, true, notes.join("; ")));
        }
        notes.push(format!(
            "manual intervention required for: {}",
            manual.join(", ")
        ));
        Ok(RepairStepResult {
            suggested_action: Some(check.remediation().to_string()),
            ..check_result(check, true, notes.join("; "))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::DurableWriter;
    use crate::steps::InstallStep;
    use crate::testing::MockHost;
    use serde_json::json;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn store(dir: &Path) -> CheckpointStore {
        CheckpointStore::new(dir.join("checkpoint.json"), "0.1.0", DurableWriter::default())
    }

    fn healthy_host() -> MockHost {
        let host = MockHost::default();
        host.set_daemon_running(true);
        *host.config.borrow_mut() = json!({"gateway": {"mode": "local"}});
        host
    }

    fn step<'r>(report: &'r RepairReport, id: &str) -> &'r RepairStepResult {
        report
            .steps
            .iter()
            .find(|step| step.step == id)
            .unwrap_or_else(|| panic!("missing step {id}"))
    }

    #[test]
    fn healthy_install_passes_every_check() {
        let dir = tempdir().unwrap();
        let checkpoints = store(dir.path());
        checkpoints.write(InstallStep::Complete, None).unwrap();
        let host = healthy_host();
        let collaborators = host.collaborators();

        let report = RepairRunner::new(&collaborators, &checkpoints, 1).repair();

        assert!(report.overall_success);
        assert_eq!(report.steps.len(), REPAIR_CHECK_COUNT);
        assert_eq!(report.failures().count(), 0);
        assert_eq!(step(&report, "auto_fix").message, "nothing to fix");
        assert_eq!(step(&report, "gateway_health").message, "gateway is healthy");
        assert!(host.calls().contains(&"health.evaluate".to_string()));
        assert!(step(&report, "summary").message.starts_with("6 of 6 checks passed"));
        assert!(!host.calls().contains(&"daemon.restart".to_string()));
    }

    #[test]
    fn stopped_daemon_triggers_restart() {
        let dir = tempdir().unwrap();
        let checkpoints = store(dir.path());
        checkpoints.write(InstallStep::Complete, None).unwrap();
        let host = healthy_host();
        host.set_daemon_running(false);
        let collaborators = host.collaborators();

        let report = RepairRunner::new(&collaborators, &checkpoints, 1).repair();

        let calls = host.calls();
        assert!(calls.contains(&"daemon.restart".to_string()));
        assert!(calls.contains(&"health.is_running".to_string()));
        assert!(!calls.contains(&"health.evaluate".to_string()));
        assert_eq!(
            step(&report, "gateway_health").message,
            "gateway process is not running"
        );
        let fix = step(&report, "auto_fix");
        assert!(fix.passed);
        assert_eq!(fix.message, "daemon restarted; manual intervention required for: gateway_health");
        // daemon_process and gateway_health both failed before the fix.
        assert_eq!(report.failures().count(), 2);
        assert!(!report.overall_success);

        let lenient = RepairRunner::new(&collaborators, &checkpoints, 2).repair();
        assert!(lenient.overall_success);
    }

    #[test]
    fn every_check_runs_even_when_all_collaborators_fail() {
        let dir = tempdir().unwrap();
        let checkpoints = store(dir.path());
        fs::write(checkpoints.path(), "not json").unwrap();
        let host = MockHost::default();
        for call in [
            "runtime.resolve",
            "config.get_current_config",
            "daemon.status",
            "daemon.restart",
            "health.evaluate",
        ] {
            host.fail(call);
        }
        let collaborators = host.collaborators();

        let report = RepairRunner::new(&collaborators, &checkpoints, 1).repair();

        assert_eq!(report.steps.len(), REPAIR_CHECK_COUNT);
        assert!(!report.overall_success);
        assert!(step(&report, "checkpoint_file").message.contains("corrupt"));
        assert!(step(&report, "runtime_binary")
            .message
            .contains("runtime.resolve exploded"));
        assert!(step(&report, "auto_fix")
            .message
            .contains("daemon.restart exploded"));
        assert!(step(&report, "summary").passed);
        assert!(step(&report, "runtime_binary").suggested_action.is_some());

        let value = serde_json::to_value(&report).unwrap();
        let completed_at = value["completedAt"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(completed_at).is_ok());
        assert_eq!(value["overallSuccess"], false);
    }

    #[test]
    fn failed_checkpoint_points_at_resume_step() {
        let dir = tempdir().unwrap();
        let checkpoints = store(dir.path());
        checkpoints
            .write(InstallStep::Credentials, Some("keychain locked"))
            .unwrap();
        let host = healthy_host();
        let collaborators = host.collaborators();

        let report = RepairRunner::new(&collaborators, &checkpoints, 1).repair();

        let checkpoint = step(&report, "checkpoint_file");
        assert!(!checkpoint.passed);
        assert!(checkpoint.message.contains("keychain locked"));
        assert!(checkpoint
            .suggested_action
            .as_deref()
            .unwrap()
            .contains("`credentials`"));
        assert!(step(&report, "auto_fix")
            .message
            .contains("manual intervention required for: checkpoint_file"));
        assert!(report.overall_success);
    }
}
