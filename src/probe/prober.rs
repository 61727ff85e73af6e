//! Readiness probe implementations.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, Uri};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::{ProbeProtocol, ProbeSpec};
use crate::http::client::HyperClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub ok: bool,
    pub detail: String,
    pub latency: Duration,
}

impl ProbeOutcome {
    fn pass(detail: impl Into<String>, latency: Duration) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
            latency,
        }
    }

    fn fail(detail: impl Into<String>, latency: Duration) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
            latency,
        }
    }
}

/// One readiness check. Implementations never hang past the probe timeout.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn check(&self, unit: &str, spec: &ProbeSpec) -> ProbeOutcome;
}

pub struct ReadinessProber {
    client: HyperClient,
}

impl ReadinessProber {
    pub fn new(client: HyperClient) -> Self {
        Self { client }
    }

    async fn http(&self, spec: &ProbeSpec) -> Result<String, String> {
        let target = spec.target.as_deref().ok_or("http probe without target")?;
        let uri: Uri = target.parse().map_err(|e| format!("invalid url {}: {}", target, e))?;
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(
                Empty::<Bytes>::new()
                    .map_err(|never: std::convert::Infallible| match never {})
                    .boxed(),
            )
            .map_err(|e| e.to_string())?;

        let resp = self.client.request(req).await.map_err(|e| e.to_string())?;
        let status = resp.status();
        // Drain so the pooled connection can be reused.
        let _ = resp.into_body().collect().await;

        let ok = match spec.expect_status {
            Some(code) => status.as_u16() == code,
            None => status.is_success(),
        };
        if ok {
            Ok(format!("http {}", status.as_u16()))
        } else {
            Err(format!("http {}", status.as_u16()))
        }
    }

    async fn tcp(&self, spec: &ProbeSpec) -> Result<String, String> {
        let target = spec.target.as_deref().ok_or("tcp probe without target")?;
        TcpStream::connect(target)
            .await
            .map(|_| format!("tcp connected {}", target))
            .map_err(|e| format!("tcp {}: {}", target, e))
    }

    async fn exec(&self, spec: &ProbeSpec) -> Result<String, String> {
        let argv = spec.command.as_deref().unwrap_or_default();
        let (program, args) = argv.split_first().ok_or("exec probe without command")?;
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("exec {}: {}", program, e))?;
        if output.status.success() {
            Ok("exec exit 0".to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "exec exit {}: {}",
                output.status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                stderr.trim()
            ))
        }
    }
}

#[async_trait]
impl Prober for ReadinessProber {
    async fn check(&self, _unit: &str, spec: &ProbeSpec) -> ProbeOutcome {
        let started = Instant::now();
        let attempt = async {
            match spec.protocol {
                ProbeProtocol::Launched => Ok("launched".to_string()),
                ProbeProtocol::Http => self.http(spec).await,
                ProbeProtocol::Tcp => self.tcp(spec).await,
                ProbeProtocol::Exec => self.exec(spec).await,
            }
        };

        match timeout(spec.timeout(), attempt).await {
            Ok(Ok(detail)) => ProbeOutcome::pass(detail, started.elapsed()),
            Ok(Err(detail)) => ProbeOutcome::fail(detail, started.elapsed()),
            Err(_) => ProbeOutcome::fail(
                format!("timed out after {:?}", spec.timeout()),
                started.elapsed(),
            ),
        }
    }
}
