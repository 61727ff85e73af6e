// Package model provides the runtime unit model shared by the scheduler and the console.

pub mod unit;


// Re-export main types
pub use unit::{BlockedBy, DegradedReason, LifecycleState, ProbeResult, ServiceUnit, UnitStatus};
