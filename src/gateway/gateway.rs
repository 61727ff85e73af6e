//! The mock/proxy gateway request path.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::fault::GatewayFault;
use super::journal::{Journal, Outcome, Record};
use super::proxy;
use super::rule::{Disposition, MockResponse};
use super::rules::RuleStore;
use super::upstream;
use crate::config::GATEWAY_HEALTH_PATH;
use crate::http::client::HyperClient;
use crate::metrics;
use crate::template;

pub struct Gateway {
    rules: Arc<RuleStore>,
    journal: Arc<Journal>,
    client: HyperClient,
    upstream_timeout: Duration,
    max_body: usize,
}

/// Where a resolved call went, for the journal.
struct Routed {
    rule: Option<String>,
    disposition: Option<&'static str>,
    upstream: Option<String>,
}

impl Gateway {
    pub fn new(
        rules: Arc<RuleStore>,
        journal: Arc<Journal>,
        client: HyperClient,
        upstream_timeout: Duration,
        max_body: usize,
    ) -> Self {
        Self {
            rules,
            journal,
            client,
            upstream_timeout,
            max_body,
        }
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(GATEWAY_HEALTH_PATH, get(Self::health))
            .fallback(Self::dispatch)
            .with_state(self)
    }

    async fn health(State(gw): State<Arc<Gateway>>) -> impl IntoResponse {
        let rules = gw.rules.current();
        Json(json!({
            "status": "ok",
            "rules": rules.len(),
            "generation": gw.rules.generation(),
        }))
    }

    async fn dispatch(State(gw): State<Arc<Gateway>>, req: Request) -> Response {
        gw.handle(req).await
    }

    /// Resolves one call against the current rule set and answers it.
    pub async fn handle(&self, req: Request) -> Response {
        let started = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);

        let (routed, result) = self.route(req, &method, &path, query.as_deref()).await;

        let (outcome, response) = match result {
            Ok(resp) => (
                Outcome::Status {
                    code: resp.status().as_u16(),
                },
                resp,
            ),
            Err(fault) => {
                warn!(
                    component = "gateway",
                    event = "fault",
                    method = %method,
                    path = %path,
                    fault = fault.tag(),
                    error = %fault,
                    "gateway fault"
                );
                (Outcome::Fault { fault: fault.tag() }, fault.into_response())
            }
        };

        let latency = started.elapsed();
        metrics::record_gateway_call(
            routed.disposition.unwrap_or("none"),
            match &outcome {
                Outcome::Status { .. } => "ok",
                Outcome::Fault { fault } => *fault,
            },
            latency,
        );
        debug!(
            component = "gateway",
            event = "call",
            method = %method,
            path = %path,
            rule = routed.rule.as_deref().unwrap_or("-"),
            status = response.status().as_u16(),
            latency_ms = latency.as_millis() as u64,
            "gateway call"
        );

        self.journal.push(Record {
            method: method.to_string(),
            path,
            query,
            rule: routed.rule,
            disposition: routed.disposition,
            upstream: routed.upstream,
            outcome,
            latency_ms: latency.as_millis() as u64,
        });

        response
    }

    async fn route(
        &self,
        req: Request,
        method: &Method,
        path: &str,
        query: Option<&str>,
    ) -> (Routed, Result<Response, GatewayFault>) {
        let rules = self.rules.current();
        let Some(rule) = rules.resolve(method, path) else {
            let routed = Routed {
                rule: None,
                disposition: None,
                upstream: None,
            };
            let fault = GatewayFault::NoMatch {
                method: method.to_string(),
                path: path.to_string(),
            };
            return (routed, Err(fault));
        };

        let mut routed = Routed {
            rule: Some(rule.name.clone()),
            disposition: Some(rule.disposition.kind()),
            upstream: None,
        };

        let result = match &rule.disposition {
            Disposition::Mock(mock) => render_mock(&rule.name, mock, method, path, query),
            Disposition::Proxy { upstream } => {
                routed.upstream = Some(upstream.clone());
                self.proxy(req, upstream, path, query).await
            }
        };
        (routed, result)
    }

    async fn proxy(
        &self,
        req: Request,
        upstream: &str,
        path: &str,
        query: Option<&str>,
    ) -> Result<Response, GatewayFault> {
        let uri = proxy::upstream_uri(upstream, path, query).map_err(|e| GatewayFault::UpstreamError {
            upstream: upstream.to_string(),
            reason: e.to_string(),
        })?;

        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, self.max_body)
            .await
            .map_err(|_| GatewayFault::BodyTooLarge {
                limit: self.max_body,
            })?;

        let headers = proxy::upstream_request_headers(&parts.headers);
        let resp = upstream::forward(
            &self.client,
            upstream,
            parts.method,
            uri,
            headers,
            body,
            self.upstream_timeout,
        )
        .await?;

        let (mut head, body) = resp.into_parts();
        head.headers = proxy::strip_hop_by_hop(&head.headers);
        Ok(Response::from_parts(head, Body::from(body)))
    }
}

fn render_mock(
    rule: &str,
    mock: &MockResponse,
    method: &Method,
    path: &str,
    query: Option<&str>,
) -> Result<Response, GatewayFault> {
    let vars = BTreeMap::from([
        ("method".to_string(), method.to_string()),
        ("path".to_string(), path.to_string()),
        ("query".to_string(), query.unwrap_or_default().to_string()),
    ]);
    let body = template::render(&mock.body, &vars).map_err(|source| GatewayFault::MockRender {
        rule: rule.to_string(),
        source,
    })?;

    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = mock.status;
    for (name, value) in &mock.headers {
        resp.headers_mut().insert(name.clone(), value.clone());
    }
    if !resp.headers().contains_key(axum::http::header::CONTENT_TYPE) {
        resp.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    Ok(resp)
}
