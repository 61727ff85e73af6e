// Package gateway implements the mock/proxy gateway: rule resolution, the call
// journal, upstream forwarding and the supervised gateway unit.

pub mod fault;
pub mod gateway;
pub mod journal;
pub mod proxy;
pub mod rule;
pub mod rules;
pub mod unit;
pub mod upstream;

#[cfg(test)]
mod gateway_test;
#[cfg(test)]
mod proxy_test;

pub use fault::{GatewayFault, FAULT_HEADER};
pub use gateway::Gateway;
pub use journal::{Journal, JournalEntry};
pub use rule::{Disposition, RoutingRule, RuleContext, RuleError};
pub use rules::{RuleSet, RuleStore};
pub use unit::GatewayUnit;
