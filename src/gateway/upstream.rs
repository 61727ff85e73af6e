//! Upstream forwarding over the shared hyper client.

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::{HeaderMap, Method, Request, Response, Uri};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::fault::GatewayFault;
use crate::http::client::HyperClient;

fn request_body(body: Bytes) -> BoxBody<Bytes, hyper::Error> {
    if body.is_empty() {
        Empty::<Bytes>::new()
            .map_err(|never: std::convert::Infallible| match never {})
            .boxed()
    } else {
        Full::new(body)
            .map_err(|never: std::convert::Infallible| match never {})
            .boxed()
    }
}

/// Sends one request upstream and reads the whole response. A single
/// deadline covers connect, response head and body, so an upstream that
/// stalls mid-body still ends in a gateway timeout.
pub async fn forward(
    client: &HyperClient,
    upstream: &str,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
    timeout_duration: Duration,
) -> Result<Response<Bytes>, GatewayFault> {
    let deadline = Instant::now() + timeout_duration;
    let timed_out = || GatewayFault::GatewayTimeout {
        upstream: upstream.to_string(),
        timeout: timeout_duration,
    };

    let mut req = Request::builder()
        .method(method)
        .uri(uri)
        .body(request_body(body))
        .map_err(|e| GatewayFault::UpstreamError {
            upstream: upstream.to_string(),
            reason: e.to_string(),
        })?;
    *req.headers_mut() = headers;

    let resp = match timeout_at(deadline, client.request(req)).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) if e.is_connect() => {
            debug!(component = "gateway", event = "upstream_unavailable", upstream = %upstream, error = ?e, "upstream connect failed");
            return Err(GatewayFault::UpstreamUnavailable {
                upstream: upstream.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(Err(e)) => {
            return Err(GatewayFault::UpstreamError {
                upstream: upstream.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => return Err(timed_out()),
    };

    let (head, incoming) = resp.into_parts();
    match timeout_at(deadline, incoming.collect()).await {
        Ok(Ok(collected)) => Ok(Response::from_parts(head, collected.to_bytes())),
        Ok(Err(e)) => Err(GatewayFault::UpstreamError {
            upstream: upstream.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => {
            debug!(component = "gateway", event = "upstream_body_stalled", upstream = %upstream, "upstream body missed the deadline");
            Err(timed_out())
        }
    }
}
