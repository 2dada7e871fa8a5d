use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dirs::home_dir;
use serde::{Deserialize, Serialize};

use crate::collaborators::{DiscoveredSecret, InstallMethod};
use crate::durable::{read_file, DurableOptions};
use crate::error::{ClawupError, Result};
use crate::orchestrator::InstallRequest;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub paths: Paths,
    pub durable: DurableConfig,
    pub runtime: RuntimeConfig,
    pub install: InstallConfig,
    pub daemon: DaemonConfig,
    pub repair: RepairConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub state_dir: String,
    pub agent_home: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DurableConfig {
    pub lock_attempts: u32,
    pub lock_backoff_min_ms: u64,
    pub lock_backoff_max_ms: u64,
    pub rename_retries: u32,
    pub rename_jitter_max_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub binary: String,
    pub min_major: u32,
    pub sha256: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct InstallConfig {
    pub method: InstallMethod,
    pub package: String,
    pub version: String,
    pub script_url: String,
    pub source_repo: String,
    pub config: serde_json::Value,
    pub credentials: Vec<CredentialSource>,
}

/// Environment variable to pick a secret up from, and where to file it.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CredentialSource {
    pub service: String,
    pub key: String,
    pub env: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub command: String,
    pub args: Vec<String>,
    pub port: u16,
    pub start_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RepairConfig {
    /// Failed checks tolerated before a repair run is reported unsuccessful.
    pub max_failures: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            paths: Paths::default(),
            durable: DurableConfig::default(),
            runtime: RuntimeConfig::default(),
            install: InstallConfig::default(),
            daemon: DaemonConfig::default(),
            repair: RepairConfig::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            state_dir: "~/.local/state/clawup".to_string(),
            agent_home: "~/.openclaw".to_string(),
        }
    }
}

impl Default for DurableConfig {
    fn default() -> Self {
        let defaults = DurableOptions::default();
        Self {
            lock_attempts: defaults.lock_attempts,
            lock_backoff_min_ms: defaults.lock_backoff_min.as_millis() as u64,
            lock_backoff_max_ms: defaults.lock_backoff_max.as_millis() as u64,
            rename_retries: defaults.rename_retries,
            rename_jitter_max_ms: defaults.rename_jitter_max.as_millis() as u64,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "node".to_string(),
            min_major: 22,
            sha256: None,
        }
    }
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            method: InstallMethod::PackageManager,
            package: "openclaw".to_string(),
            version: "latest".to_string(),
            script_url: "".to_string(),
            source_repo: "".to_string(),
            config: serde_json::json!({"gateway": {"mode": "local"}}),
            credentials: vec![
                CredentialSource {
                    service: "anthropic".to_string(),
                    key: "ANTHROPIC_API_KEY".to_string(),
                    env: "ANTHROPIC_API_KEY".to_string(),
                },
                CredentialSource {
                    service: "openai".to_string(),
                    key: "OPENAI_API_KEY".to_string(),
                    env: "OPENAI_API_KEY".to_string(),
                },
            ],
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            command: "openclaw".to_string(),
            args: vec!["gateway".to_string()],
            port: 18789,
            start_timeout_ms: 10_000,
        }
    }
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self { max_failures: 1 }
    }
}

impl DurableConfig {
    pub fn options(&self) -> DurableOptions {
        DurableOptions {
            lock_attempts: self.lock_attempts,
            lock_backoff_min: Duration::from_millis(self.lock_backoff_min_ms),
            lock_backoff_max: Duration::from_millis(self.lock_backoff_max_ms),
            rename_retries: self.rename_retries,
            rename_jitter_max: Duration::from_millis(self.rename_jitter_max_ms),
            ..DurableOptions::default()
        }
    }
}

impl Config {
    /// Build the install request, picking credentials up from `lookup`.
    pub fn install_request(&self, lookup: impl Fn(&str) -> Option<String>) -> InstallRequest {
        let secrets = self
            .install
            .credentials
            .iter()
            .filter_map(|source| {
                let value = lookup(&source.env)?;
                let value = value.trim();
                (!value.is_empty()).then(|| DiscoveredSecret {
                    service: source.service.clone(),
                    key: source.key.clone(),
                    value: value.to_string(),
                })
            })
            .collect();
        InstallRequest {
            method: self.install.method,
            package: self.install.package.clone(),
            version: self.install.version.clone(),
            config_patch: self.install.config.clone(),
            secrets,
        }
    }
}

/// Every on-disk location clawup touches, after `~` expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPaths {
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
    pub checkpoint: PathBuf,
    pub progress_log: PathBuf,
    pub receipt: PathBuf,
    pub agent_home: PathBuf,
    pub agent_config: PathBuf,
    pub credentials_dir: PathBuf,
    pub daemon_pid: PathBuf,
    pub daemon_log: PathBuf,
    pub source_dir: PathBuf,
}

impl ResolvedPaths {
    pub fn new(config_path: &Path, cfg: &Config) -> Self {
        let state_dir = PathBuf::from(expand_path(&cfg.paths.state_dir));
        let agent_home = PathBuf::from(expand_path(&cfg.paths.agent_home));
        Self {
            config_path: config_path.to_path_buf(),
            checkpoint: state_dir.join("checkpoint.json"),
            progress_log: state_dir.join("progress.jsonl"),
            receipt: state_dir.join("receipt.json"),
            agent_config: agent_home.join("openclaw.json"),
            credentials_dir: agent_home.join("credentials"),
            daemon_pid: agent_home.join("daemon.pid"),
            daemon_log: agent_home.join("logs").join("daemon.log"),
            source_dir: agent_home.join("src"),
            state_dir,
            agent_home,
        }
    }
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("CLAWUP_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("clawup");
    base
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    default_config_dir().join("config.yaml")
}

pub fn expand_path(input: &str) -> String {
    if input == "~" {
        if let Some(home) = home_dir() {
            return home.to_string_lossy().to_string();
        }
    }
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn default_config_yaml() -> Result<String> {
    Ok(serde_yaml::to_string(&Config::default())?)
}

pub fn read_config_from_str(content: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config> {
    read_config_from_str(&read_file(path)?)
}

/// Read the config file, falling back to defaults when it does not exist.
pub fn load_config(path: &Path) -> Result<Config> {
    match read_config(path) {
        Err(ClawupError::NotFound { .. }) => Ok(Config::default()),
        other => other,
    }
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    if cfg.version != CONFIG_VERSION {
        return Err(ClawupError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    if cfg.paths.state_dir.trim().is_empty() || cfg.paths.agent_home.trim().is_empty() {
        return Err(ClawupError::Config(
            "paths.state_dir and paths.agent_home must be non-empty".to_string(),
        ));
    }
    if cfg.durable.lock_attempts == 0 {
        return Err(ClawupError::Config(
            "durable.lock_attempts must be at least 1".to_string(),
        ));
    }
    if cfg.durable.lock_backoff_min_ms > cfg.durable.lock_backoff_max_ms {
        return Err(ClawupError::Config(
            "durable.lock_backoff_min_ms must not exceed durable.lock_backoff_max_ms".to_string(),
        ));
    }
    if cfg.runtime.binary.trim().is_empty() {
        return Err(ClawupError::Config("runtime.binary must be non-empty".to_string()));
    }
    if let Some(sha) = &cfg.runtime.sha256 {
        if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ClawupError::Config(
                "runtime.sha256 must be a 64-character hex digest".to_string(),
            ));
        }
    }
    if cfg.daemon.command.trim().is_empty() {
        return Err(ClawupError::Config("daemon.command must be non-empty".to_string()));
    }
    match cfg.install.method {
        InstallMethod::Script if cfg.install.script_url.trim().is_empty() => {
            return Err(ClawupError::Config(
                "install.script_url is required for the script method".to_string(),
            ));
        }
        InstallMethod::Source if cfg.install.source_repo.trim().is_empty() => {
            return Err(ClawupError::Config(
                "install.source_repo is required for the source method".to_string(),
            ));
        }
        _ => {}
    }
    if !cfg.install.config.is_object() {
        return Err(ClawupError::Config(
            "install.config must be a mapping".to_string(),
        ));
    }
    for source in &cfg.install.credentials {
        if source.service.trim().is_empty()
            || source.key.trim().is_empty()
            || source.env.trim().is_empty()
        {
            return Err(ClawupError::Config(
                "install.credentials entries need non-empty service, key and env".to_string(),
            ));
        }
    }
    Ok(())
}
