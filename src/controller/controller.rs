// HTTP controller trait for route registration.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde::Serialize;

/// Trait for adding routes to the HTTP server.
pub trait Controller: Send + Sync {
    /// Adds routes to the router.
    ///
    /// Commonly may be represented as:
    /// ```rust
    /// # use axum::{Router, routing::get};
    /// # async fn handler() -> &'static str { "ok" }
    /// let router: Router<()> = Router::new().route("/path", get(handler));
    /// # let _ = router;
    /// ```
    fn add_route(&self, router: Router) -> Router;
}

/// JSON body with an explicit status.
pub fn json<T: Serialize>(status: StatusCode, body: &T) -> Response {
    (
        status,
        [("content-type", "application/json; charset=utf-8")],
        serde_json::to_string(body).unwrap_or_default(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub error: String,
}

pub fn error(status: StatusCode, message: impl Into<String>) -> Response {
    json(
        status,
        &ErrorResponse {
            status: status.as_u16(),
            error: message.into(),
        },
    )
}
