#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::{ProbeProtocol, ProbeSpec};
    use crate::http::client::create_client;
    use crate::probe::{Prober, ReadinessProber};
    use crate::support::upstream::{closed_base, spawn_upstream};

    fn prober() -> ReadinessProber {
        ReadinessProber::new(create_client())
    }

    fn exec(argv: &[&str]) -> ProbeSpec {
        ProbeSpec {
            protocol: ProbeProtocol::Exec,
            command: Some(argv.iter().map(|s| s.to_string()).collect()),
            ..ProbeSpec::launched()
        }
    }

    #[tokio::test]
    async fn test_launched_always_passes() {
        assert!(prober().check("u", &ProbeSpec::launched()).await.ok);
    }

    /// Any 2xx passes by default; an explicit expected status must match exactly.
    #[tokio::test]
    async fn test_http_status_matching() {
        let upstream = spawn_upstream().await;
        let p = prober();

        let ok = p.check("api", &ProbeSpec::http(format!("{}/healthz", upstream.base))).await;
        assert!(ok.ok, "{}", ok.detail);
        assert_eq!(ok.detail, "http 200");

        let mut spec = ProbeSpec::http(format!("{}/status/503", upstream.base));
        assert!(!p.check("api", &spec).await.ok);
        spec.expect_status = Some(503);
        assert!(p.check("api", &spec).await.ok);
    }

    /// A probe slower than its timeout fails instead of hanging.
    #[tokio::test]
    async fn test_http_timeout_is_a_failure() {
        let upstream = spawn_upstream().await;
        let mut spec = ProbeSpec::http(format!("{}/slow", upstream.base));
        spec.timeout = Some(Duration::from_millis(200));

        let outcome = prober().check("api", &spec).await;
        assert!(!outcome.ok);
        assert!(outcome.detail.contains("timed out"), "{}", outcome.detail);
        assert!(outcome.latency < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_tcp_probe() {
        let upstream = spawn_upstream().await;
        let mut spec = ProbeSpec {
            protocol: ProbeProtocol::Tcp,
            target: Some(upstream.addr.to_string()),
            ..ProbeSpec::launched()
        };
        assert!(prober().check("db", &spec).await.ok);

        let closed = closed_base().await;
        spec.target = Some(closed.trim_start_matches("http://").to_string());
        assert!(!prober().check("db", &spec).await.ok);
    }

    #[tokio::test]
    async fn test_exec_probe_exit_code() {
        assert!(prober().check("q", &exec(&["true"])).await.ok);

        let outcome = prober()
            .check("q", &exec(&["sh", "-c", "echo not yet >&2; exit 1"]))
            .await;
        assert!(!outcome.ok);
        assert!(outcome.detail.contains("not yet"), "{}", outcome.detail);
    }
}
