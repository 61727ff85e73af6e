// Package controller provides the console liveness endpoint.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

use crate::http::Controller;

pub const HEALTH_PATH: &str = "/healthz";

const SUCCESS_RESPONSE: &str = r#"{
  "status": 200,
  "message": "console is up"
}"#;

/// HealthController answers liveness checks for the console itself.
#[derive(Clone, Default)]
pub struct HealthController;

impl HealthController {
    pub fn new() -> Self {
        Self
    }

    async fn health() -> Response {
        (
            StatusCode::OK,
            [("content-type", "application/json; charset=utf-8")],
            SUCCESS_RESPONSE,
        )
            .into_response()
    }
}

impl Controller for HealthController {
    fn add_route(&self, router: Router) -> Router {
        router.route(HEALTH_PATH, get(Self::health))
    }
}
