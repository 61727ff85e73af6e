// Shared test support code for unit and end-to-end tests.

pub mod harness;
pub mod upstream;

pub use harness::{
    console_json, free_port, sh_unit, stack_config, wait_for_log, wait_for_state, TestStack,
};
