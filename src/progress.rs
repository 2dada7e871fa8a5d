use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::durable::ensure_parent;
use crate::error::{ClawupError, Result};
use crate::steps::InstallStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
    Skipped,
}

impl ProgressStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressStatus::Running => "running",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
            ProgressStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ProgressStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub step: InstallStep,
    pub status: ProgressStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl ProgressEvent {
    pub fn new(step: InstallStep, status: ProgressStatus, message: impl Into<String>) -> Self {
        let progress = match status {
            ProgressStatus::Running => None,
            _ => Some(step.percent()),
        };
        Self {
            step,
            status,
            message: message.into(),
            progress,
        }
    }
}

pub trait ProgressSink {
    fn publish(&self, event: &ProgressEvent) -> Result<()>;
}

/// Fans events out to every subscriber. Delivery is best effort.
#[derive(Default)]
pub struct ProgressBus {
    sinks: Vec<Box<dyn ProgressSink>>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, sink: impl ProgressSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn with(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.subscribe(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn emit(&self, event: ProgressEvent) {
        for sink in &self.sinks {
            if let Err(err) = sink.publish(&event) {
                warn!(step = %event.step, "progress listener failed: {err}");
            }
        }
    }
}

/// In-process callback.
pub struct FnSink<F>(pub F);

impl<F> ProgressSink for FnSink<F>
where
    F: Fn(&ProgressEvent),
{
    fn publish(&self, event: &ProgressEvent) -> Result<()> {
        (self.0)(event);
        Ok(())
    }
}

/// Forwards events to a receiver on another thread.
pub struct ChannelSink(pub Sender<ProgressEvent>);

impl ProgressSink for ChannelSink {
    fn publish(&self, event: &ProgressEvent) -> Result<()> {
        self.0
            .send(event.clone())
            .map_err(|_| ClawupError::Process("progress receiver disconnected".to_string()))
    }
}

/// Appends one JSON object per event, for tailing by a UI.
pub struct JsonLinesSink {
    path: PathBuf,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProgressSink for JsonLinesSink {
    fn publish(&self, event: &ProgressEvent) -> Result<()> {
        ensure_parent(&self.path)?;
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}
