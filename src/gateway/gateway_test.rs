#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::gateway::journal::Outcome;
    use crate::gateway::{Gateway, Journal, RuleContext, RuleSet, RuleStore, FAULT_HEADER};
    use crate::http::client::create_client;
    use crate::support::upstream::{closed_base, spawn_upstream};

    fn gateway(rules: &str) -> Arc<Gateway> {
        let set = RuleSet::parse(rules, &RuleContext::default()).expect("rules");
        Arc::new(Gateway::new(
            Arc::new(RuleStore::from_set(set)),
            Arc::new(Journal::new(10)),
            create_client(),
            Duration::from_millis(500),
            1 << 16,
        ))
    }

    async fn call(router: Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let resp = router.oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        (status, headers, body.to_vec())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    /// An unmatched call fails closed with a tagged 404; nothing is proxied.
    #[tokio::test]
    async fn test_no_match_fails_closed() {
        let gw = gateway("rules:\n  - path: /known\n    mock: {}\n");
        let (status, headers, body) = call(gw.clone().router(), get("/unknown?x=1")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(headers.get(FAULT_HEADER).unwrap(), "no-match");
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["fault"], "no-match");

        let entry = &gw.journal().recent(1)[0];
        assert_eq!(entry.path, "/unknown");
        assert_eq!(entry.query.as_deref(), Some("x=1"));
        assert!(entry.rule.is_none());
        assert_eq!(entry.outcome, Outcome::Fault { fault: "no-match" });
    }

    /// Mocks render method, path and query placeholders without any network call.
    #[tokio::test]
    async fn test_mock_renders_template() {
        let gw = gateway(
            r#"
rules:
  - name: case
    method: GET
    path: /cases/*
    mock:
      status: 202
      headers: { x-mock: "yes" }
      body: '{"seen":"{{method}} {{path}} {{query}}"}'
"#,
        );
        let (status, headers, body) = call(gw.clone().router(), get("/cases/42?full=1")).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(headers.get("x-mock").unwrap(), "yes");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["seen"], "GET /cases/42 full=1");

        let entry = &gw.journal().recent(1)[0];
        assert_eq!(entry.rule.as_deref(), Some("case"));
        assert_eq!(entry.disposition, Some("mock"));
    }

    /// Proxying keeps method, path, query and body, and strips hop-by-hop
    /// headers in both directions.
    #[tokio::test]
    async fn test_proxy_forwards_call() {
        let upstream = spawn_upstream().await;
        let gw = gateway(&format!(
            "rules:\n  - name: up\n    path: /api/*\n    proxy: {{ upstream: \"{}\" }}\n",
            upstream.base
        ));

        let req = Request::builder()
            .method("POST")
            .uri("/api/submit?draft=true")
            .header("host", "ui.local:3000")
            .header("proxy-authorization", "secret")
            .header("authorization", "Bearer t")
            .body(Body::from("payload"))
            .unwrap();
        let (status, headers, body) = call(gw.clone().router(), req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-upstream").unwrap(), "echo");
        assert!(headers.get("keep-alive").is_none());

        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["method"], "POST");
        assert_eq!(json["path"], "/api/submit");
        assert_eq!(json["query"], "draft=true");
        assert_eq!(json["body"], "payload");
        assert_eq!(json["x_forwarded_host"], "ui.local:3000");
        assert_eq!(json["authorization"], "Bearer t");
        assert!(json["proxy_authorization"].is_null());

        let entry = &gw.journal().recent(1)[0];
        assert_eq!(entry.upstream.as_deref(), Some(upstream.base.as_str()));
        assert_eq!(entry.outcome, Outcome::Status { code: 200 });
    }

    /// Upstream status codes pass through untouched.
    #[tokio::test]
    async fn test_proxy_passes_upstream_status() {
        let upstream = spawn_upstream().await;
        let gw = gateway(&format!(
            "rules:\n  - path: /status/*\n    proxy: {{ upstream: \"{}\" }}\n",
            upstream.base
        ));
        let (status, headers, _) = call(gw.router(), get("/status/418")).await;
        assert_eq!(status, StatusCode::IM_A_TEAPOT);
        assert!(headers.get(FAULT_HEADER).is_none());
    }

    /// A refused connection is an upstream-unavailable 502.
    #[tokio::test]
    async fn test_upstream_unavailable() {
        let base = closed_base().await;
        let gw = gateway(&format!("rules:\n  - path: /*\n    proxy: {{ upstream: \"{}\" }}\n", base));
        let (status, headers, _) = call(gw.router(), get("/anything")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(headers.get(FAULT_HEADER).unwrap(), "upstream-unavailable");
    }

    /// An upstream slower than the timeout is a gateway-timeout 504.
    #[tokio::test]
    async fn test_gateway_timeout() {
        let upstream = spawn_upstream().await;
        let gw = gateway(&format!(
            "rules:\n  - path: /slow\n    proxy: {{ upstream: \"{}\" }}\n",
            upstream.base
        ));
        let (status, headers, _) = call(gw.router(), get("/slow")).await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(headers.get(FAULT_HEADER).unwrap(), "gateway-timeout");
    }

    /// An upstream that sends its head and then stalls mid-body still ends
    /// in a gateway-timeout 504 within the deadline.
    #[tokio::test]
    async fn test_gateway_timeout_on_stalled_body() {
        let upstream = spawn_upstream().await;
        let gw = gateway(&format!(
            "rules:\n  - path: /stall\n    proxy: {{ upstream: \"{}\" }}\n",
            upstream.base
        ));
        let (status, headers, _) = tokio::time::timeout(Duration::from_secs(3), call(gw.router(), get("/stall")))
            .await
            .expect("stalled body must not hang the caller");
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(headers.get(FAULT_HEADER).unwrap(), "gateway-timeout");
    }

    /// The reserved health path answers even with no rules.
    #[tokio::test]
    async fn test_health_endpoint() {
        let gw = gateway("rules: []\n");
        let (status, _, body) = call(gw.router(), get("/__devstack/health")).await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["rules"], 0);
    }

    /// A swapped rule set applies to the very next call.
    #[tokio::test]
    async fn test_swap_applies_to_next_call() {
        let gw = gateway("rules:\n  - path: /x\n    mock: { status: 200 }\n");
        assert_eq!(call(gw.clone().router(), get("/x")).await.0, StatusCode::OK);

        let next = RuleSet::parse("rules:\n  - path: /x\n    mock: { status: 503 }\n", &RuleContext::default()).unwrap();
        gw.rules().swap(next);
        assert_eq!(call(gw.router(), get("/x")).await.0, StatusCode::SERVICE_UNAVAILABLE);
    }
}
