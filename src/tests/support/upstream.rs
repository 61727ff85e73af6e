// Test upstream server for gateway and probe tests.

use axum::{
    body::Bytes,
    extract::{Path, Request},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{any, get},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// How long `/slow` waits before answering.
pub const SLOW_DELAY: Duration = Duration::from_secs(3);

pub struct TestUpstream {
    pub addr: SocketAddr,
    pub base: String,
    handle: JoinHandle<()>,
}

impl Drop for TestUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Echoes the call back as JSON and adds a hop-by-hop header the gateway
/// must strip.
async fn echo(req: Request) -> impl IntoResponse {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();
    let headers = req.headers().clone();
    let body = axum::body::to_bytes(req.into_body(), 1 << 20)
        .await
        .unwrap_or_default();

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let mut out = HeaderMap::new();
    out.insert("keep-alive", "timeout=5".parse().unwrap());
    out.insert("x-upstream", "echo".parse().unwrap());
    (
        StatusCode::OK,
        out,
        Json(json!({
            "method": method,
            "path": path,
            "query": query,
            "body": String::from_utf8_lossy(&body),
            "x_forwarded_host": header("x-forwarded-host"),
            "proxy_authorization": header("proxy-authorization"),
            "authorization": header("authorization"),
        })),
    )
}

async fn slow() -> impl IntoResponse {
    tokio::time::sleep(SLOW_DELAY).await;
    "late"
}

/// Sends the head and a first chunk, then never finishes the body.
async fn stall() -> impl IntoResponse {
    use futures::StreamExt;
    let chunks = futures::stream::once(async { Ok::<_, std::convert::Infallible>(Bytes::from_static(b"partial")) })
        .chain(futures::stream::pending());
    axum::body::Body::from_stream(chunks)
}

async fn status(Path(code): Path<u16>) -> impl IntoResponse {
    (StatusCode::from_u16(code).unwrap_or(StatusCode::OK), Bytes::from_static(b"status"))
}

/// Starts the test upstream on an ephemeral port.
pub async fn spawn_upstream() -> TestUpstream {
    let app = Router::new()
        .route("/slow", get(slow))
        .route("/stall", get(stall))
        .route("/status/:code", any(status))
        .fallback(echo);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestUpstream {
        addr,
        base: format!("http://{}", addr),
        handle,
    }
}

/// A base URL nothing listens on.
pub async fn closed_base() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}
