// Package supervisor launches, watches and stops units as OS processes,
// Docker containers or in-process gateway servers.

pub mod container;
pub mod env;
pub mod logs;
pub mod process;

#[cfg(test)]
mod process_test;

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::UnitKind;

pub use container::ContainerSupervisor;
pub use env::{build_launch_spec, read_env_file};
pub use logs::{LogBuffer, LogHub, LogLine, LogStream};
pub use process::ProcessSupervisor;

/// Lines of log tail attached to launch failures and exits.
pub const DIAGNOSTIC_LINES: usize = 20;

/// Everything a supervisor needs to launch one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub kind: UnitKind,
    pub command: Vec<String>,
    pub image: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitExit {
    pub code: Option<i64>,
    pub diagnostics: String,
}

impl UnitExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for UnitExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code)?,
            None => f.write_str("killed by signal")?,
        }
        if !self.diagnostics.is_empty() {
            write!(f, ": {}", self.diagnostics)?;
        }
        Ok(())
    }
}

/// A successfully launched unit. The watch flips to `Some` once it exits.
#[derive(Debug, Clone)]
pub struct Launched {
    pub pid: Option<u32>,
    pub exit: watch::Receiver<Option<UnitExit>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the grace period.
    Graceful,
    /// Killed after the grace period ran out.
    Forced,
    /// Had already exited on its own.
    AlreadyExited,
    /// Nothing was tracked under that name.
    NotRunning,
}

impl StopOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopOutcome::Graceful => "graceful",
            StopOutcome::Forced => "forced",
            StopOutcome::AlreadyExited => "already_exited",
            StopOutcome::NotRunning => "not_running",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("unit {unit:?}: invalid launch spec: {reason}")]
    InvalidSpec { unit: String, reason: String },
    #[error("unit {unit:?}: spawn failed: {source}")]
    Spawn {
        unit: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unit {unit:?}: launch failed ({}): {diagnostics}", code.map(|c| c.to_string()).unwrap_or_else(|| "no exit code".into()))]
    LaunchFailed {
        unit: String,
        code: Option<i64>,
        diagnostics: String,
    },
    #[error("unit {unit:?}: docker: {source}")]
    Docker {
        unit: String,
        #[source]
        source: bollard::errors::Error,
    },
    #[error("unit {unit:?}: no supervisor for {kind} units")]
    Unsupported { unit: String, kind: &'static str },
    #[error("unit {unit:?}: signal failed: {source}")]
    Signal {
        unit: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Launches the unit. Returns once it survived the launch window.
    async fn start(&self, spec: &LaunchSpec) -> Result<Launched, SupervisorError>;

    /// Stops the unit, forcing it after `grace`. Bookkeeping for the unit is
    /// released whichever way the stop ends.
    async fn stop(&self, unit: &str, grace: Duration) -> Result<StopOutcome, SupervisorError>;

    fn logs(&self, unit: &str) -> Option<Arc<LogBuffer>>;
}

/// Dispatches to the supervisor matching each unit's kind.
pub struct StackSupervisor {
    logs: Arc<LogHub>,
    process: Arc<dyn Supervisor>,
    container: Option<Arc<dyn Supervisor>>,
    gateway: Option<Arc<dyn Supervisor>>,
    kinds: DashMap<String, UnitKind>,
}

impl StackSupervisor {
    pub fn new(logs: Arc<LogHub>, process: Arc<dyn Supervisor>) -> Self {
        Self {
            logs,
            process,
            container: None,
            gateway: None,
            kinds: DashMap::new(),
        }
    }

    pub fn with_containers(mut self, container: Arc<dyn Supervisor>) -> Self {
        self.container = Some(container);
        self
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn Supervisor>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    fn backend(&self, unit: &str, kind: UnitKind) -> Result<&Arc<dyn Supervisor>, SupervisorError> {
        let backend = match kind {
            UnitKind::Process => Some(&self.process),
            UnitKind::Container => self.container.as_ref(),
            UnitKind::Gateway => self.gateway.as_ref(),
        };
        backend.ok_or_else(|| SupervisorError::Unsupported {
            unit: unit.to_string(),
            kind: kind.as_str(),
        })
    }
}

#[async_trait]
impl Supervisor for StackSupervisor {
    async fn start(&self, spec: &LaunchSpec) -> Result<Launched, SupervisorError> {
        let backend = self.backend(&spec.name, spec.kind)?;
        self.kinds.insert(spec.name.clone(), spec.kind);
        let result = backend.start(spec).await;
        if result.is_err() {
            self.kinds.remove(&spec.name);
        }
        result
    }

    async fn stop(&self, unit: &str, grace: Duration) -> Result<StopOutcome, SupervisorError> {
        let Some((_, kind)) = self.kinds.remove(unit) else {
            return Ok(StopOutcome::NotRunning);
        };
        self.backend(unit, kind)?.stop(unit, grace).await
    }

    fn logs(&self, unit: &str) -> Option<Arc<LogBuffer>> {
        self.logs.get(unit)
    }
}
