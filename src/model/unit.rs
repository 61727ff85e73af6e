//! Service unit lifecycle model.
//!
//! A [`ServiceUnit`] pairs an immutable descriptor with the mutable lifecycle
//! state owned by the scheduler. Everything else observes units through
//! [`UnitStatus`] snapshots.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::config::ServiceDescriptor;

/// Why a unit that was once Ready is no longer serving reliably.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DegradedReason {
    /// Health monitor probes are failing while the unit keeps running.
    ProbeFailing,
    /// The unit exited on its own after reaching Ready.
    Exited,
    /// A direct dependency exited or was restarted.
    Dependency(String),
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradedReason::ProbeFailing => f.write_str("probe-failing"),
            DegradedReason::Exited => f.write_str("exited"),
            DegradedReason::Dependency(name) => write!(f, "dependency:{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Pending,
    Starting,
    AwaitingReady,
    Ready,
    Degraded(DegradedReason),
    Stopped,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Starting => "starting",
            LifecycleState::AwaitingReady => "awaiting_ready",
            LifecycleState::Ready => "ready",
            LifecycleState::Degraded(_) => "degraded",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, LifecycleState::Ready)
    }

    /// Starting or AwaitingReady: counted against the start concurrency limit.
    pub fn is_launching(&self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::AwaitingReady)
    }

    /// States in which the supervisor holds a live process, container or task.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            LifecycleState::Starting
                | LifecycleState::AwaitingReady
                | LifecycleState::Ready
                | LifecycleState::Degraded(_)
        )
    }

    pub fn reason(&self) -> Option<&DegradedReason> {
        match self {
            LifecycleState::Degraded(reason) => Some(reason),
            _ => None,
        }
    }

    /// Reports whether the lifecycle graph has an edge from `self` to `next`.
    pub fn can_transition_to(&self, next: &LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Pending, Starting) | (Pending, Stopped) => true,
            (Starting, AwaitingReady) | (Starting, Failed) | (Starting, Stopped) => true,
            (AwaitingReady, Ready) | (AwaitingReady, Failed) | (AwaitingReady, Stopped) => true,
            (Ready, Degraded(_)) | (Ready, Stopped) => true,
            (Degraded(_), Ready) | (Degraded(_), Stopped) => true,
            (Degraded(a), Degraded(b)) => a != b,
            (Failed, Stopped) => true,
            (Stopped, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Degraded(reason) => write!(f, "degraded({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// What keeps a Pending unit from starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockedBy {
    /// A dependency reached Failed.
    Dependency(String),
    /// A secret bundle the unit reads did not resolve.
    Bundle(String),
}

impl fmt::Display for BlockedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockedBy::Dependency(name) => write!(f, "dependency:{}", name),
            BlockedBy::Bundle(name) => write!(f, "bundle:{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub at: DateTime<Utc>,
    pub ok: bool,
    pub detail: String,
    pub attempt: u32,
}

#[derive(Debug, Clone)]
pub struct ServiceUnit {
    pub spec: Arc<ServiceDescriptor>,
    pub state: LifecycleState,
    pub since: DateTime<Utc>,
    pub last_probe: Option<ProbeResult>,
    pub blocked_by: Option<BlockedBy>,
    pub restarts: u32,
    /// Incremented on every start; events carrying an older epoch are stale.
    pub epoch: u64,
    /// Exit code and diagnostics of the last launch failure or exit.
    pub last_exit: Option<String>,
}

impl ServiceUnit {
    pub fn new(spec: Arc<ServiceDescriptor>) -> Self {
        Self {
            spec,
            state: LifecycleState::Pending,
            since: Utc::now(),
            last_probe: None,
            blocked_by: None,
            restarts: 0,
            epoch: 0,
            last_exit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn status(&self) -> UnitStatus {
        UnitStatus {
            name: self.spec.name.clone(),
            kind: self.spec.kind.as_str(),
            state: self.state.as_str(),
            reason: self.state.reason().map(|r| r.to_string()),
            since: self.since,
            last_probe: self.last_probe.clone(),
            blocked_by: self.blocked_by.as_ref().map(|b| b.to_string()),
            restarts: self.restarts,
            last_exit: self.last_exit.clone(),
            depends_on: self.spec.depends_on.clone(),
        }
    }
}

/// Point-in-time view of a unit, served by the console.
#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub name: String,
    pub kind: &'static str,
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub since: DateTime<Utc>,
    pub last_probe: Option<ProbeResult>,
    pub blocked_by: Option<String>,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<String>,
    pub depends_on: Vec<String>,
}
