use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ClawupError;

/// Install steps in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStep {
    Runtime,
    Openclaw,
    Config,
    Credentials,
    Daemon,
    Health,
    Complete,
}

impl InstallStep {
    pub const ALL: [InstallStep; 7] = [
        InstallStep::Runtime,
        InstallStep::Openclaw,
        InstallStep::Config,
        InstallStep::Credentials,
        InstallStep::Daemon,
        InstallStep::Health,
        InstallStep::Complete,
    ];

    pub fn first() -> InstallStep {
        Self::ALL[0]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// The step after `self`, or `None` once `complete` has been reached.
    pub fn next(self) -> Option<InstallStep> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Steps from `self` (inclusive) to the end.
    pub fn remaining(self) -> &'static [InstallStep] {
        &Self::ALL[self.index()..]
    }

    pub fn is_critical(self) -> bool {
        matches!(
            self,
            InstallStep::Runtime
                | InstallStep::Config
                | InstallStep::Credentials
                | InstallStep::Complete
        )
    }

    /// Percentage of the sequence finished once this step is done.
    pub fn percent(self) -> u8 {
        (((self.index() + 1) * 100) / Self::ALL.len()) as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstallStep::Runtime => "runtime",
            InstallStep::Openclaw => "openclaw",
            InstallStep::Config => "config",
            InstallStep::Credentials => "credentials",
            InstallStep::Daemon => "daemon",
            InstallStep::Health => "health",
            InstallStep::Complete => "complete",
        }
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallStep {
    type Err = ClawupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|step| step.as_str() == s.trim())
            .ok_or_else(|| ClawupError::Config(format!("unknown install step: {s}")))
    }
}
