use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::durable::{read_file, DurableWriter};
use crate::error::{ClawupError, Result};
use crate::steps::InstallStep;

/// The last install step attempted, successful or not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub step: InstallStep,
    pub completed_at: DateTime<Utc>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Checkpoint {
    pub fn parse(path: &Path, content: &str) -> Result<Checkpoint> {
        serde_json::from_str(content).map_err(|err| ClawupError::CheckpointCorrupt {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// Where an install run picks up after this checkpoint.
    ///
    /// A critical step recorded with an error is attempted again; anything
    /// else advances to the following step.
    pub fn resume_step(&self) -> Option<InstallStep> {
        if self.failed() && self.step.is_critical() {
            Some(self.step)
        } else {
            self.step.next()
        }
    }
}

/// Owns the single checkpoint file of an installation.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    version: String,
    writer: DurableWriter,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>, version: impl Into<String>, writer: DurableWriter) -> Self {
        Self {
            path: path.into(),
            version: version.into(),
            writer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unparsable checkpoints both read as `None`.
    pub fn get(&self) -> Result<Option<Checkpoint>> {
        match self.load() {
            Ok(checkpoint) => Ok(checkpoint),
            Err(ClawupError::CheckpointCorrupt { path, reason }) => {
                warn!(path = %path.display(), "ignoring corrupt checkpoint: {reason}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Like [`CheckpointStore::get`] but reports corruption instead of hiding it.
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        let content = match read_file(&self.path) {
            Ok(content) => content,
            Err(ClawupError::NotFound { .. }) => return Ok(None),
            Err(err) => return Err(err),
        };
        Checkpoint::parse(&self.path, &content).map(Some)
    }

    pub fn write(&self, step: InstallStep, error: Option<&str>) -> Result<Checkpoint> {
        let checkpoint = Checkpoint {
            step,
            completed_at: Utc::now(),
            version: self.version.clone(),
            error: error.map(str::to_string),
        };
        let body = serde_json::to_string_pretty(&checkpoint)?;
        self.writer.write(&self.path, format!("{body}\n"))?;
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn store(dir: &Path) -> CheckpointStore {
        CheckpointStore::new(dir.join("checkpoint.json"), "0.1.0", DurableWriter::default())
    }

    #[test]
    fn absent_checkpoint_reads_as_none() {
        let dir = tempdir().unwrap();
        assert_eq!(store(dir.path()).get().unwrap(), None);
    }

    #[test]
    fn corrupt_checkpoint_reads_as_none_but_load_reports_it() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        fs::write(store.path(), "{\"step\": \"conf").unwrap();
        assert_eq!(store.get().unwrap(), None);
        let err = store.load().unwrap_err();
        assert!(matches!(err, ClawupError::CheckpointCorrupt { .. }));
    }

    #[test]
    fn write_overwrites_single_marker_with_wire_shape() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.write(InstallStep::Runtime, None).unwrap();
        store
            .write(InstallStep::Openclaw, Some("npm exited with status 1"))
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["step"], "openclaw");
        assert_eq!(raw["version"], "0.1.0");
        assert_eq!(raw["error"], "npm exited with status 1");
        assert!(raw["completedAt"]
            .as_str()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .is_some());

        store.write(InstallStep::Config, None).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["step"], "config");
        assert!(raw.get("error").is_none());
    }

    #[test]
    fn resume_step_retries_failed_critical_steps_only() {
        let checkpoint = |step, error: Option<&str>| Checkpoint {
            step,
            completed_at: Utc::now(),
            version: "0.1.0".to_string(),
            error: error.map(str::to_string),
        };
        assert_eq!(
            checkpoint(InstallStep::Config, None).resume_step(),
            Some(InstallStep::Credentials)
        );
        assert_eq!(
            checkpoint(InstallStep::Config, Some("boom")).resume_step(),
            Some(InstallStep::Config)
        );
        assert_eq!(
            checkpoint(InstallStep::Daemon, Some("boom")).resume_step(),
            Some(InstallStep::Health)
        );
        assert_eq!(checkpoint(InstallStep::Complete, None).resume_step(), None);
    }
}
