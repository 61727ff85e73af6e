// Package scheduler starts units in dependency order, gates them on readiness
// and reacts to exits, probe failures and operator restarts.

pub mod readiness;
pub mod scheduler;
pub mod state;

#[cfg(test)]
mod readiness_test;

pub use readiness::ReadinessOutcome;
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerOptions};
pub use state::{StateChange, UnitTable};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown unit {0:?}")]
    UnknownUnit(String),
    #[error("unit {unit:?}: no transition from {from} to {to}")]
    InvalidTransition { unit: String, from: String, to: String },
    #[error("unit {unit:?} cannot be restarted while {state}")]
    RestartNotAllowed { unit: String, state: String },
    #[error("scheduler is not running")]
    NotRunning,
}
