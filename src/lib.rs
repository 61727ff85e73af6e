#[path = "shared/template/mod.rs"]
pub mod template;
#[cfg(test)]
mod tests;

#[cfg(test)]
pub use tests::support;

pub mod app;
pub mod config;
pub mod controller;
pub mod gateway;
pub mod graph;
pub mod http;
pub mod metrics;
pub mod middleware;
pub mod model;
pub mod probe;
pub mod scheduler;
pub mod secrets;
pub mod shutdown;
pub mod supervisor;
