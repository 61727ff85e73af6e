// Operator console controllers: unit status, logs, gateway journal and rules,
// secret refresh, liveness and metrics.

pub mod controller;
pub mod gateway;
pub mod logs;
pub mod metrics;
pub mod probe;
pub mod secrets;
pub mod status;


// Re-export controller types for convenience
pub use gateway::GatewayController;
pub use logs::LogsController;
pub use metrics::PrometheusMetricsController;
pub use probe::HealthController;
pub use secrets::SecretsController;
pub use status::StatusController;
