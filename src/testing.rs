//! Recording collaborator doubles shared by the orchestrator and repair tests.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::rc::Rc;

use crate::collaborators::{
    Collaborators, ConfigCompiler, CredentialStore, DaemonManager, DaemonStatus, HealthChecker,
    PackageInstaller, PackageRequest, RuntimeInfo, RuntimeResolver,
};
use crate::error::{ClawupError, Result};
use crate::progress::{FnSink, ProgressBus, ProgressEvent};

#[derive(Clone, Default)]
pub(crate) struct MockHost {
    calls: Rc<RefCell<Vec<String>>>,
    failing: Rc<RefCell<BTreeSet<String>>>,
    unverified: Rc<Cell<bool>>,
    daemon_running: Rc<Cell<bool>>,
    pub config: Rc<RefCell<serde_json::Value>>,
    pub stored: Rc<RefCell<Vec<(String, String, String)>>>,
}

impl MockHost {
    pub fn fail(&self, call: &str) {
        self.failing.borrow_mut().insert(call.to_string());
    }

    pub fn recover(&self, call: &str) {
        self.failing.borrow_mut().remove(call);
    }

    pub fn set_unverified(&self) {
        self.unverified.set(true);
    }

    pub fn set_daemon_running(&self, running: bool) {
        self.daemon_running.set(running);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    /// Distinct collaborator prefixes touched, in first-call order.
    pub fn touched(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for call in self.calls.borrow().iter() {
            let prefix = call.split('.').next().unwrap_or_default().to_string();
            if !seen.contains(&prefix) {
                seen.push(prefix);
            }
        }
        seen
    }

    fn record(&self, call: &str) -> Result<()> {
        self.calls.borrow_mut().push(call.to_string());
        if self.failing.borrow().contains(call) {
            return Err(ClawupError::Process(format!("{call} exploded")));
        }
        Ok(())
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            runtime: Box::new(self.clone()),
            installer: Box::new(self.clone()),
            config: Box::new(self.clone()),
            credentials: Box::new(self.clone()),
            daemon: Box::new(self.clone()),
            health: Box::new(self.clone()),
        }
    }
}

impl RuntimeResolver for MockHost {
    fn resolve(&self) -> Result<RuntimeInfo> {
        self.record("runtime.resolve")?;
        Ok(RuntimeInfo {
            path: PathBuf::from("/usr/bin/node"),
            version: "22.4.0".to_string(),
            verified: !self.unverified.get(),
        })
    }
}

impl PackageInstaller for MockHost {
    fn install(
        &self,
        request: &PackageRequest,
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<Option<String>> {
        self.record("installer.install")?;
        on_progress(&format!("added 1 package: {}", request.package));
        Ok(Some("1.2.3".to_string()))
    }
}

impl ConfigCompiler for MockHost {
    fn get_current_config(&self) -> Result<serde_json::Value> {
        self.record("config.get_current_config")?;
        Ok(self.config.borrow().clone())
    }

    fn apply(&self, partial: &serde_json::Value) -> Result<()> {
        self.record("config.apply")?;
        *self.config.borrow_mut() = partial.clone();
        Ok(())
    }
}

impl CredentialStore for MockHost {
    fn store(&self, service: &str, key: &str, value: &str) -> Result<()> {
        self.record("credentials.store")?;
        self.stored
            .borrow_mut()
            .push((service.to_string(), key.to_string(), value.to_string()));
        Ok(())
    }
}

impl DaemonManager for MockHost {
    fn start(&self) -> Result<()> {
        self.record("daemon.start")?;
        self.daemon_running.set(true);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.record("daemon.stop")?;
        self.daemon_running.set(false);
        Ok(())
    }

    fn restart(&self) -> Result<()> {
        self.record("daemon.restart")?;
        self.daemon_running.set(true);
        Ok(())
    }

    fn status(&self) -> Result<DaemonStatus> {
        self.record("daemon.status")?;
        let running = self.daemon_running.get();
        Ok(DaemonStatus {
            running,
            pid: running.then_some(4242),
        })
    }

    fn install_service(&self) -> Result<()> {
        self.record("daemon.install_service")
    }

    fn uninstall_service(&self) -> Result<()> {
        self.record("daemon.uninstall_service")
    }
}

impl HealthChecker for MockHost {
    fn is_running(&self) -> Result<bool> {
        self.record("health.is_running")?;
        Ok(self.daemon_running.get())
    }

    fn evaluate(&self) -> Result<bool> {
        self.record("health.evaluate")?;
        Ok(self.daemon_running.get())
    }
}

pub(crate) fn recording_bus() -> (ProgressBus, Rc<RefCell<Vec<ProgressEvent>>>) {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink_events = events.clone();
    let bus = ProgressBus::new().with(FnSink(move |event: &ProgressEvent| {
        sink_events.borrow_mut().push(event.clone())
    }));
    (bus, events)
}
