//! Unit state table.
//!
//! Written only by the scheduler loop; read by anyone holding a handle.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::SchedulerError;
use crate::config::ServiceDescriptor;
use crate::metrics;
use crate::model::{LifecycleState, ServiceUnit, UnitStatus};

const CHANGES_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub unit: String,
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
}

pub struct UnitTable {
    units: RwLock<Vec<ServiceUnit>>,
    index: HashMap<String, usize>,
    changes: broadcast::Sender<StateChange>,
}

impl UnitTable {
    pub fn new(descriptors: &[Arc<ServiceDescriptor>]) -> Self {
        let (changes, _) = broadcast::channel(CHANGES_CAPACITY);
        Self {
            units: RwLock::new(descriptors.iter().cloned().map(ServiceUnit::new).collect()),
            index: descriptors
                .iter()
                .enumerate()
                .map(|(i, d)| (d.name.clone(), i))
                .collect(),
            changes,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Status of every unit in declaration order.
    pub fn snapshot(&self) -> Vec<UnitStatus> {
        self.units.read().iter().map(ServiceUnit::status).collect()
    }

    pub fn status(&self, name: &str) -> Option<UnitStatus> {
        self.read(name, ServiceUnit::status)
    }

    pub fn state(&self, name: &str) -> Option<LifecycleState> {
        self.read(name, |u| u.state.clone())
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.read(name, |u| u.state.is_ready()).unwrap_or(false)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }

    pub fn read<R>(&self, name: &str, f: impl FnOnce(&ServiceUnit) -> R) -> Option<R> {
        let i = *self.index.get(name)?;
        let units = self.units.read();
        Some(f(&units[i]))
    }

    pub fn update<R>(&self, name: &str, f: impl FnOnce(&mut ServiceUnit) -> R) -> Option<R> {
        let i = *self.index.get(name)?;
        let mut units = self.units.write();
        Some(f(&mut units[i]))
    }

    /// Moves a unit along a lifecycle edge and returns the previous state.
    /// Edges the lifecycle graph does not allow are rejected untouched.
    pub fn transition(&self, name: &str, next: LifecycleState) -> Result<LifecycleState, SchedulerError> {
        let i = *self
            .index
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownUnit(name.to_string()))?;

        let (prev, at) = {
            let mut units = self.units.write();
            let unit = &mut units[i];
            if !unit.state.can_transition_to(&next) {
                return Err(SchedulerError::InvalidTransition {
                    unit: name.to_string(),
                    from: unit.state.to_string(),
                    to: next.to_string(),
                });
            }
            let prev = std::mem::replace(&mut unit.state, next.clone());
            unit.since = Utc::now();
            (prev, unit.since)
        };

        info!(
            component = "scheduler",
            event = "transition",
            unit = name,
            from = %prev,
            to = %next,
            "unit state changed"
        );
        metrics::record_transition(name, next.as_str());

        let _ = self.changes.send(StateChange {
            unit: name.to_string(),
            from: prev.to_string(),
            to: next.to_string(),
            at,
        });
        Ok(prev)
    }
}
