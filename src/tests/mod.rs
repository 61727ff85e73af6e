//! End-to-end tests for devstack.
//!
//! These run the whole application against real `sh` processes: start
//! ordering, exit propagation, launch failures and config rejection.

mod cases_config_test;

pub mod support;
