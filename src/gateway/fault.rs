//! Gateway faults: responses the gateway synthesises instead of a rule result.

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;

use crate::template::TemplateError;

pub const FAULT_HEADER: &str = "x-devstack-fault";

#[derive(Debug, thiserror::Error)]
pub enum GatewayFault {
    #[error("no routing rule matches {method} {path}")]
    NoMatch { method: String, path: String },
    #[error("upstream {upstream} did not answer within {timeout:?}")]
    GatewayTimeout { upstream: String, timeout: Duration },
    #[error("upstream {upstream} unavailable: {reason}")]
    UpstreamUnavailable { upstream: String, reason: String },
    #[error("upstream {upstream} failed: {reason}")]
    UpstreamError { upstream: String, reason: String },
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("mock {rule:?}: {source}")]
    MockRender {
        rule: String,
        #[source]
        source: TemplateError,
    },
}

impl GatewayFault {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayFault::NoMatch { .. } => StatusCode::NOT_FOUND,
            GatewayFault::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayFault::UpstreamUnavailable { .. } | GatewayFault::UpstreamError { .. } => {
                StatusCode::BAD_GATEWAY
            }
            GatewayFault::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayFault::MockRender { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            GatewayFault::NoMatch { .. } => "no-match",
            GatewayFault::GatewayTimeout { .. } => "gateway-timeout",
            GatewayFault::UpstreamUnavailable { .. } => "upstream-unavailable",
            GatewayFault::UpstreamError { .. } => "upstream-error",
            GatewayFault::BodyTooLarge { .. } => "body-too-large",
            GatewayFault::MockRender { .. } => "mock-render",
        }
    }
}

impl IntoResponse for GatewayFault {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "status": status.as_u16(),
            "fault": self.tag(),
            "message": self.to_string(),
        });
        let mut resp = (status, Json(body)).into_response();
        resp.headers_mut()
            .insert(FAULT_HEADER, HeaderValue::from_static(self.tag()));
        resp
    }
}
