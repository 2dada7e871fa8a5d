//! On-host implementations of the collaborator traits used by the binary.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Read};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use dirs::home_dir;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::collaborators::{
    Collaborators, ConfigCompiler, CredentialStore, DaemonManager, DaemonStatus, HealthChecker,
    InstallMethod, PackageInstaller, PackageRequest, RuntimeInfo, RuntimeResolver,
};
use crate::config::{Config, ResolvedPaths};
use crate::durable::{ensure_parent, read_file, DurableWriter};
use crate::error::{ClawupError, Result};

const SERVICE_LABEL: &str = "ai.openclaw.gateway";

pub fn local_collaborators(
    cfg: &Config,
    paths: &ResolvedPaths,
    writer: &DurableWriter,
) -> Collaborators {
    let daemon = ProcessDaemonManager {
        command: cfg.daemon.command.clone(),
        args: cfg.daemon.args.clone(),
        port: cfg.daemon.port,
        pid_file: paths.daemon_pid.clone(),
        log_file: paths.daemon_log.clone(),
        service_dir: None,
        start_timeout: Duration::from_millis(cfg.daemon.start_timeout_ms),
        writer: writer.clone(),
    };
    Collaborators {
        runtime: Box::new(LocalRuntimeResolver {
            binary: cfg.runtime.binary.clone(),
            min_major: cfg.runtime.min_major,
            sha256: cfg.runtime.sha256.clone(),
        }),
        installer: Box::new(CommandPackageInstaller {
            script_url: cfg.install.script_url.clone(),
            source_repo: cfg.install.source_repo.clone(),
            source_dir: paths.source_dir.clone(),
        }),
        config: Box::new(JsonConfigCompiler::new(
            paths.agent_config.clone(),
            writer.clone(),
        )),
        credentials: Box::new(FileCredentialStore::new(
            paths.credentials_dir.clone(),
            writer.clone(),
        )),
        health: Box::new(PortHealthChecker {
            daemon: daemon.clone(),
            port: cfg.daemon.port,
        }),
        daemon: Box::new(daemon),
    }
}

#[derive(Debug, Clone)]
pub struct LocalRuntimeResolver {
    pub binary: String,
    pub min_major: u32,
    pub sha256: Option<String>,
}

impl RuntimeResolver for LocalRuntimeResolver {
    fn resolve(&self) -> Result<RuntimeInfo> {
        let path = which::which(&self.binary).map_err(|err| {
            ClawupError::Process(format!("runtime `{}` not found on PATH: {err}", self.binary))
        })?;
        let output = Command::new(&path).arg("--version").output()?;
        if !output.status.success() {
            return Err(ClawupError::Process(format!(
                "`{} --version` exited with {}",
                path.display(),
                output.status
            )));
        }
        let version = parse_version(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            ClawupError::Process(format!("could not parse runtime version from {}", path.display()))
        })?;
        let major_ok = version_major(&version).is_some_and(|major| major >= self.min_major);
        if !major_ok {
            warn!(version = %version, min_major = self.min_major, "runtime is too old");
        }
        let checksum_ok = match &self.sha256 {
            Some(expected) => {
                let actual = sha256_file(&path)?;
                if actual != expected.to_lowercase() {
                    warn!(path = %path.display(), expected = %expected, actual = %actual, "runtime checksum mismatch");
                    false
                } else {
                    true
                }
            }
            None => true,
        };
        Ok(RuntimeInfo {
            path,
            version,
            verified: major_ok && checksum_ok,
        })
    }
}

fn parse_version(raw: &str) -> Option<String> {
    raw.split_whitespace()
        .map(|token| token.trim_start_matches('v'))
        .find(|token| {
            token.split('.').count() >= 2
                && token.split('.').all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
        })
        .map(str::to_string)
}

fn version_major(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

/// Pulls the digest out of `shasum`, `sha256sum` or `openssl dgst` output.
fn parse_checksum(content: &str) -> Option<String> {
    for raw in content.split_whitespace() {
        let candidate = raw
            .trim_matches(|c: char| !c.is_ascii_hexdigit())
            .to_lowercase();
        if candidate.len() == 64 && candidate.chars().all(|c| c.is_ascii_hexdigit()) {
            return Some(candidate);
        }
    }
    None
}

// First tool that runs and prints a digest wins.
fn sha256_file(path: &Path) -> Result<String> {
    let path_str = path.to_string_lossy().to_string();
    let attempts: Vec<(&str, Vec<String>)> = vec![
        (
            "shasum",
            vec!["-a".to_string(), "256".to_string(), path_str.clone()],
        ),
        ("sha256sum", vec![path_str.clone()]),
        (
            "openssl",
            vec!["dgst".to_string(), "-sha256".to_string(), path_str],
        ),
    ];
    for (program, args) in attempts {
        let Ok(output) = Command::new(program).args(&args).output() else {
            continue;
        };
        if !output.status.success() {
            continue;
        }
        if let Some(token) = parse_checksum(&String::from_utf8_lossy(&output.stdout)) {
            return Ok(token);
        }
    }
    Err(ClawupError::Process(
        "no SHA256 tool found (expected shasum, sha256sum, or openssl)".to_string(),
    ))
}

#[derive(Debug, Clone)]
pub struct CommandPackageInstaller {
    pub script_url: String,
    pub source_repo: String,
    pub source_dir: PathBuf,
}

impl CommandPackageInstaller {
    fn npm(request: &PackageRequest) -> PathBuf {
        request
            .runtime
            .as_ref()
            .and_then(|runtime| runtime.path.parent().map(|dir| dir.join("npm")))
            .filter(|candidate| candidate.exists())
            .unwrap_or_else(|| PathBuf::from("npm"))
    }

    fn installed_version(npm: &Path, package: &str) -> Option<String> {
        let output = Command::new(npm)
            .args(["ls", "-g", package, "--json", "--depth=0"])
            .stderr(Stdio::null())
            .output()
            .ok()?;
        let value: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        value["dependencies"][package]["version"]
            .as_str()
            .map(str::to_string)
    }
}

impl PackageInstaller for CommandPackageInstaller {
    fn install(
        &self,
        request: &PackageRequest,
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<Option<String>> {
        let npm = Self::npm(request);
        match request.method {
            InstallMethod::PackageManager => {
                let spec = format!("{}@{}", request.package, request.version);
                let mut cmd = Command::new(&npm);
                cmd.args(["install", "-g", spec.as_str()]);
                run_streaming(cmd, on_progress)?;
                Ok(Self::installed_version(&npm, &request.package))
            }
            InstallMethod::Script => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c")
                    .arg(format!("curl -fsSL {} | sh", shell_single_quote(&self.script_url)));
                run_streaming(cmd, on_progress)?;
                Ok(None)
            }
            InstallMethod::Source => {
                if self.source_dir.join(".git").exists() {
                    let mut pull = Command::new("git");
                    pull.arg("-C").arg(&self.source_dir).args(["pull", "--ff-only"]);
                    run_streaming(pull, on_progress)?;
                } else {
                    ensure_parent(&self.source_dir)?;
                    let mut clone = Command::new("git");
                    clone.arg("clone").arg(&self.source_repo).arg(&self.source_dir);
                    run_streaming(clone, on_progress)?;
                }
                for args in [&["install"][..], &["run", "build"][..]] {
                    let mut cmd = Command::new(&npm);
                    cmd.args(args).current_dir(&self.source_dir);
                    run_streaming(cmd, on_progress)?;
                }
                Ok(None)
            }
        }
    }
}

/// Run `cmd`, forwarding each stdout line as it arrives.
fn run_streaming(mut cmd: Command, on_progress: &mut dyn FnMut(&str)) -> Result<()> {
    let rendered = format!("{cmd:?}");
    debug!(command = %rendered, "running");
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| ClawupError::Process(format!("failed to start {rendered}: {err}")))?;

    let stderr = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut raw = Vec::new();
            let _ = pipe.read_to_end(&mut raw);
            String::from_utf8_lossy(&raw).into_owned()
        })
    });
    let forwarded = match child.stdout.take() {
        Some(stdout) => forward_lines(stdout, on_progress),
        None => Ok(()),
    };
    let status = child.wait()?;
    let stderr = stderr
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    if let Err(err) = forwarded {
        warn!(command = %rendered, "stopped reading output: {err}");
    }
    if !status.success() {
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        return Err(ClawupError::Process(format!(
            "{rendered} exited with {status}: {}",
            tail.join(" | ")
        )));
    }
    Ok(())
}

/// Tool output is not guaranteed to be UTF-8; lines are decoded lossily.
fn forward_lines(pipe: impl Read, on_progress: &mut dyn FnMut(&str)) -> std::io::Result<()> {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end();
        if !line.is_empty() {
            on_progress(line);
        }
    }
}

/// Agent configuration kept as a single JSON document.
#[derive(Debug, Clone)]
pub struct JsonConfigCompiler {
    path: PathBuf,
    writer: DurableWriter,
}

impl JsonConfigCompiler {
    pub fn new(path: PathBuf, writer: DurableWriter) -> Self {
        Self { path, writer }
    }
}

impl ConfigCompiler for JsonConfigCompiler {
    fn get_current_config(&self) -> Result<serde_json::Value> {
        match read_file(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(ClawupError::NotFound { .. }) => Ok(json!({})),
            Err(err) => Err(err),
        }
    }

    fn apply(&self, partial: &serde_json::Value) -> Result<()> {
        let mut current = self.get_current_config()?;
        merge_json(&mut current, partial);
        let body = serde_json::to_string_pretty(&current)?;
        self.writer.write(&self.path, format!("{body}\n"))
    }
}

fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

/// One `KEY='value'` env file per service, readable only by the user.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
    writer: DurableWriter,
}

impl FileCredentialStore {
    pub fn new(dir: PathBuf, writer: DurableWriter) -> Self {
        Self { dir, writer }
    }

    pub fn path_for(&self, service: &str) -> PathBuf {
        self.dir.join(format!("{service}.env"))
    }
}

impl CredentialStore for FileCredentialStore {
    fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
        let valid_service = !service.is_empty()
            && service
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_service {
            return Err(ClawupError::Config(format!("invalid credential service name: {service:?}")));
        }
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ClawupError::Config(format!("invalid credential key: {key:?}")));
        }

        fs::create_dir_all(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // Best-effort; some filesystems refuse chmod.
            let _ = fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700));
        }

        let path = self.path_for(service);
        let existing = match read_file(&path) {
            Ok(content) => content,
            Err(ClawupError::NotFound { .. }) => String::new(),
            Err(err) => return Err(err),
        };
        let prefix = format!("{key}=");
        let mut content: String = existing
            .lines()
            .filter(|line| !line.starts_with(&prefix))
            .map(|line| format!("{line}\n"))
            .collect();
        content.push_str(&format!("{key}={}\n", shell_single_quote(value)));
        self.writer.write_mode(&path, content, Some(0o600))
    }
}

// Quoted for sourcing by a shell: it's -> 'it'\''s'
fn shell_single_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Runs the gateway as a detached child process tracked by a pid file.
#[derive(Debug, Clone)]
pub struct ProcessDaemonManager {
    pub command: String,
    pub args: Vec<String>,
    pub port: u16,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    /// Where service definitions go; platform default when `None`.
    pub service_dir: Option<PathBuf>,
    pub start_timeout: Duration,
    pub writer: DurableWriter,
}

impl ProcessDaemonManager {
    fn service_file(&self) -> Option<PathBuf> {
        let (default_dir, file_name) = match std::env::consts::OS {
            "linux" => (
                home_dir().map(|home| home.join(".config").join("systemd").join("user")),
                "openclaw-gateway.service".to_string(),
            ),
            "macos" => (
                home_dir().map(|home| home.join("Library").join("LaunchAgents")),
                format!("{SERVICE_LABEL}.plist"),
            ),
            _ => return None,
        };
        let dir = self.service_dir.clone().or(default_dir)?;
        Some(dir.join(file_name))
    }

    fn service_definition(&self, program: &Path) -> String {
        if std::env::consts::OS == "macos" {
            let mut args = format!("    <string>{}</string>\n", program.display());
            for arg in &self.args {
                args.push_str(&format!("    <string>{arg}</string>\n"));
            }
            return format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n\
<plist version=\"1.0\">\n<dict>\n  <key>Label</key>\n  <string>{SERVICE_LABEL}</string>\n  \
<key>ProgramArguments</key>\n  <array>\n{args}  </array>\n  <key>KeepAlive</key>\n  <true/>\n  \
<key>StandardOutPath</key>\n  <string>{log}</string>\n  <key>StandardErrorPath</key>\n  <string>{log}</string>\n\
</dict>\n</plist>\n",
                log = self.log_file.display()
            );
        }
        let mut exec = program.display().to_string();
        for arg in &self.args {
            exec.push(' ');
            exec.push_str(arg);
        }
        format!(
            "[Unit]\nDescription=OpenClaw gateway\nAfter=network.target\n\n\
[Service]\nExecStart={exec}\nRestart=on-failure\nStandardOutput=append:{log}\nStandardError=append:{log}\n\n\
[Install]\nWantedBy=default.target\n",
            log = self.log_file.display()
        )
    }

    fn spawn(&self) -> Result<Child> {
        let program = which::which(&self.command).map_err(|err| {
            ClawupError::Process(format!("daemon command `{}` not found: {err}", self.command))
        })?;
        ensure_parent(&self.log_file)?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;
        let mut cmd = Command::new(program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);
        cmd.spawn()
            .map_err(|err| ClawupError::Process(format!("failed to start daemon: {err}")))
    }

    fn wait_until_ready(&self, child: &mut Child) -> Result<()> {
        let deadline = Instant::now() + self.start_timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Err(ClawupError::Process(format!(
                    "daemon exited during startup ({status}); see {}",
                    self.log_file.display()
                )));
            }
            if port_open(self.port, Duration::from_millis(100)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                // Still alive; readiness is left to the health check.
                debug!(port = self.port, "daemon not listening yet");
                return Ok(());
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}

impl DaemonManager for ProcessDaemonManager {
    fn start(&self) -> Result<()> {
        if self.status()?.running {
            return Ok(());
        }
        let mut child = self.spawn()?;
        let pid = child.id();
        if let Err(err) = self.writer.write(&self.pid_file, format!("{pid}\n")) {
            // Never leave a daemon running without a pid file.
            if let Err(kill) = child.kill() {
                warn!(pid, "failed to kill untracked daemon: {kill}");
            }
            let _ = child.wait();
            return Err(err);
        }
        info!(pid, "daemon started");
        if let Err(err) = self.wait_until_ready(&mut child) {
            if let Err(cleanup) = fs::remove_file(&self.pid_file) {
                warn!(pid_file = %self.pid_file.display(), "failed to remove pid file: {cleanup}");
            }
            return Err(err);
        }
        // Reap the child if it exits while this process is still alive.
        thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if let Some(pid) = read_pid_file(&self.pid_file) {
            if process_is_alive(pid) {
                let status = Command::new("kill").arg(pid.to_string()).status()?;
                if !status.success() {
                    return Err(ClawupError::Process(format!("failed to signal daemon pid {pid}")));
                }
                for _ in 0..50 {
                    if !process_is_alive(pid) {
                        break;
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                if process_is_alive(pid) {
                    return Err(ClawupError::Process(format!("daemon pid {pid} did not exit")));
                }
                info!(pid, "daemon stopped");
            }
        }
        match fs::remove_file(&self.pid_file) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn restart(&self) -> Result<()> {
        self.stop()?;
        self.start()
    }

    fn status(&self) -> Result<DaemonStatus> {
        let pid = read_pid_file(&self.pid_file).filter(|pid| process_is_alive(*pid));
        Ok(DaemonStatus {
            running: pid.is_some(),
            pid,
        })
    }

    fn install_service(&self) -> Result<()> {
        let Some(path) = self.service_file() else {
            debug!("no service manager integration on this platform");
            return Ok(());
        };
        let program = which::which(&self.command).unwrap_or_else(|_| PathBuf::from(&self.command));
        self.writer.write(&path, self.service_definition(&program))?;
        info!(path = %path.display(), "service definition written");
        Ok(())
    }

    fn uninstall_service(&self) -> Result<()> {
        let Some(path) = self.service_file() else {
            return Ok(());
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

// `kill -0` probes without signalling; pid 0 would address the whole group.
fn process_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Unreadable or garbled pid files read as no daemon.
fn read_pid_file(path: &Path) -> Option<u32> {
    let text = fs::read_to_string(path).ok()?;
    text.trim().parse::<u32>().ok()
}

fn port_open(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}

#[derive(Debug, Clone)]
pub struct PortHealthChecker {
    pub daemon: ProcessDaemonManager,
    pub port: u16,
}

impl HealthChecker for PortHealthChecker {
    fn is_running(&self) -> Result<bool> {
        Ok(self.daemon.status()?.running)
    }

    fn evaluate(&self) -> Result<bool> {
        Ok(self.is_running()? && port_open(self.port, Duration::from_secs(2)))
    }
}
