// HTTP module: console server and the shared upstream client.

pub mod client;
pub mod server;

pub use crate::middleware::Middleware;

pub use server::HttpServer;

// Common controller interface
pub use crate::controller::controller::Controller;
