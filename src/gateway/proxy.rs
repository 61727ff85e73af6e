// Proxy forwarding helpers: header hygiene and upstream URI construction.

use axum::http::header::{CONNECTION, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Uri};

/// X-Forwarded-Host header key (lowercase for HTTP header name validation).
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Hop-by-hop headers that must not be forwarded by proxies (RFC 7230, section 6.1).
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Header names listed in a `Connection` value are hop-by-hop for this message.
fn connection_listed(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Copies headers without hop-by-hop entries.
pub fn strip_hop_by_hop(src: &HeaderMap) -> HeaderMap {
    let listed = connection_listed(src);
    let mut out = HeaderMap::with_capacity(src.len());
    for (name, value) in src {
        if is_hop_by_hop(name) || listed.iter().any(|l| l == name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Extracts forwarded host from source headers, preferring X-Forwarded-Host over Host.
pub fn forwarded_host(src: &HeaderMap) -> Option<HeaderValue> {
    if let Some(host) = src.get(X_FORWARDED_HOST) {
        if !host.as_bytes().is_empty() {
            return Some(host.clone());
        }
    }
    src.get(HOST).filter(|h| !h.as_bytes().is_empty()).cloned()
}

/// Headers for the upstream request. `Host` is dropped so the client derives
/// it from the upstream URI; the caller's host travels as X-Forwarded-Host.
pub fn upstream_request_headers(src: &HeaderMap) -> HeaderMap {
    let mut out = strip_hop_by_hop(src);
    out.remove(HOST);
    if let Some(host) = forwarded_host(src) {
        out.insert(HeaderName::from_static(X_FORWARDED_HOST), host);
    }
    if !out.contains_key(X_FORWARDED_PROTO) {
        out.insert(
            HeaderName::from_static(X_FORWARDED_PROTO),
            HeaderValue::from_static("http"),
        );
    }
    out
}

/// Joins an upstream base URL (possibly with a path prefix) with the inbound
/// path and query.
pub fn upstream_uri(base: &str, path: &str, query: Option<&str>) -> Result<Uri, axum::http::uri::InvalidUri> {
    let mut target = String::with_capacity(base.len() + path.len() + 16);
    target.push_str(base.trim_end_matches('/'));
    if !path.starts_with('/') {
        target.push('/');
    }
    target.push_str(path);
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        target.push('?');
        target.push_str(q);
    }
    target.parse()
}
