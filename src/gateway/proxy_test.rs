#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue};

    use crate::gateway::proxy::{strip_hop_by_hop, upstream_request_headers, upstream_uri};

    /// Prefers X-Forwarded-Host and passes it as is.
    #[test]
    fn test_forwarded_host_prefers_xfh() {
        let mut in_headers = HeaderMap::new();
        in_headers.insert("x-forwarded-host", HeaderValue::from_static("  a.example , b.example  "));
        in_headers.insert("host", HeaderValue::from_static("ignored.example"));

        let out = upstream_request_headers(&in_headers);
        assert_eq!(out.get("x-forwarded-host").unwrap(), "  a.example , b.example  ");
        assert!(out.get("host").is_none(), "host comes from the upstream uri");
    }

    /// Falls back to Host when X-Forwarded-Host is empty.
    #[test]
    fn test_forwarded_host_fallback_to_host() {
        let mut in_headers = HeaderMap::new();
        in_headers.insert("x-forwarded-host", HeaderValue::from_static(""));
        in_headers.insert("host", HeaderValue::from_static("[2001:db8::1]:8443"));

        let out = upstream_request_headers(&in_headers);
        assert_eq!(out.get("x-forwarded-host").unwrap(), "[2001:db8::1]:8443");
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "http");
    }

    /// Hop-by-hop headers, including those named by Connection, are removed.
    #[test]
    fn test_strip_hop_by_hop() {
        let mut h = HeaderMap::new();
        h.insert("connection", HeaderValue::from_static("keep-alive, x-private"));
        h.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        h.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        h.insert("x-private", HeaderValue::from_static("1"));
        h.insert("authorization", HeaderValue::from_static("Bearer t"));
        h.append("accept", HeaderValue::from_static("a/b"));
        h.append("accept", HeaderValue::from_static("c/d"));

        let out = strip_hop_by_hop(&h);
        assert_eq!(out.len(), 3);
        assert!(out.get("x-private").is_none());
        assert_eq!(out.get_all("accept").iter().count(), 2);
        assert_eq!(out.get("authorization").unwrap(), "Bearer t");
    }

    #[test]
    fn test_upstream_uri_joins_prefix_path_and_query() {
        assert_eq!(
            upstream_uri("http://127.0.0.1:9000/api/", "/v1/cases", Some("page=2")).unwrap(),
            "http://127.0.0.1:9000/api/v1/cases?page=2"
        );
        assert_eq!(
            upstream_uri("https://staging.example", "/health", Some("")).unwrap(),
            "https://staging.example/health"
        );
    }
}
