// Application wiring.

pub mod app;

pub use app::{check, resolve_secrets, App, CheckReport};
