//! Contracts for the components that do the real work of each install step.
//!
//! Implementations own their own timeouts and must be safe to call again
//! after an interrupted run.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub path: PathBuf,
    pub version: String,
    pub verified: bool,
}

pub trait RuntimeResolver {
    /// Locate the language runtime and check its integrity.
    fn resolve(&self) -> Result<RuntimeInfo>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstallMethod {
    #[default]
    PackageManager,
    Script,
    Source,
}

impl InstallMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            InstallMethod::PackageManager => "package_manager",
            InstallMethod::Script => "script",
            InstallMethod::Source => "source",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRequest {
    pub method: InstallMethod,
    pub package: String,
    pub version: String,
    pub runtime: Option<RuntimeInfo>,
}

pub trait PackageInstaller {
    /// Install the agent software, reporting human-readable progress lines.
    /// Returns the installed version when known.
    fn install(
        &self,
        request: &PackageRequest,
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<Option<String>>;
}

pub trait ConfigCompiler {
    fn get_current_config(&self) -> Result<serde_json::Value>;
    fn apply(&self, partial: &serde_json::Value) -> Result<()>;
}

pub trait CredentialStore {
    fn store(&self, service: &str, key: &str, value: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
}

pub trait DaemonManager {
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn restart(&self) -> Result<()>;
    fn status(&self) -> Result<DaemonStatus>;
    /// Register the daemon with the platform service manager.
    fn install_service(&self) -> Result<()>;
    fn uninstall_service(&self) -> Result<()>;
}

pub trait HealthChecker {
    fn is_running(&self) -> Result<bool>;
    fn evaluate(&self) -> Result<bool>;
}

/// A secret found on the host, destined for the credential store.
#[derive(Clone, PartialEq, Eq)]
pub struct DiscoveredSecret {
    pub service: String,
    pub key: String,
    pub value: String,
}

impl std::fmt::Debug for DiscoveredSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveredSecret")
            .field("service", &self.service)
            .field("key", &self.key)
            .field("value", &"<redacted>")
            .finish()
    }
}

/// Everything the orchestrator and repair runner call out to, built once at startup.
pub struct Collaborators {
    pub runtime: Box<dyn RuntimeResolver>,
    pub installer: Box<dyn PackageInstaller>,
    pub config: Box<dyn ConfigCompiler>,
    pub credentials: Box<dyn CredentialStore>,
    pub daemon: Box<dyn DaemonManager>,
    pub health: Box<dyn HealthChecker>,
}
