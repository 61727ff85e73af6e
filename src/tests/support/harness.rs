// End-to-end harness: builds an App from a config and runs it until dropped.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::app::App;
use crate::config::{new_test_config, process_unit, Config, ServiceDescriptor};
use crate::model::LifecycleState;
use crate::scheduler::SchedulerHandle;
use crate::shutdown::GracefulShutdown;

/// Process unit running `sh -c script`.
pub fn sh_unit(name: &str, depends_on: &[&str], script: &str) -> ServiceDescriptor {
    let mut unit = process_unit(name, depends_on);
    unit.command = Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]);
    unit
}

/// A loopback port nothing listens on right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Test config without a gateway, with the console on an ephemeral port.
pub fn stack_config(services: Vec<ServiceDescriptor>) -> Config {
    let mut cfg = new_test_config();
    cfg.stack.gateway = None;
    if let Some(api) = cfg.stack.api.as_mut() {
        api.port = Some("0".to_string());
    }
    cfg.stack.services = services;
    cfg
}

pub struct TestStack {
    pub app: App,
    pub token: CancellationToken,
    pub gsh: GracefulShutdown,
}

impl TestStack {
    pub async fn start(cfg: Config) -> anyhow::Result<Self> {
        let token = CancellationToken::new();
        let app = App::new(token.clone(), cfg).await?;
        let gsh = GracefulShutdown::new(token.clone()).with_timeout(app.shutdown_budget());
        app.serve(&gsh)?;
        Ok(Self { app, token, gsh })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.app.handle()
    }

    /// Cancels and waits for every task, stopping units on the way.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.token.cancel();
        self.gsh.await_shutdown().await
    }
}

/// Polls a unit's state until `pred` holds or `within` elapses.
pub async fn wait_for_state(
    handle: &SchedulerHandle,
    unit: &str,
    within: Duration,
    pred: impl Fn(&LifecycleState) -> bool,
) -> LifecycleState {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let state = handle.state(unit).expect("unit exists");
        if pred(&state) || tokio::time::Instant::now() >= deadline {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// GET against the in-process console, parsed as JSON.
pub async fn console_json(stack: &TestStack, uri: &str) -> serde_json::Value {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    let resp = stack
        .app
        .console()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
}

/// Polls a unit's log tail until a line contains `needle`.
pub async fn wait_for_log(stack: &TestStack, unit: &str, needle: &str, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    let uri = format!("/devstack/units/{}/logs", unit);
    while tokio::time::Instant::now() < deadline {
        let tail = console_json(stack, &uri).await;
        let found = tail["lines"]
            .as_array()
            .map(|lines| lines.iter().any(|l| l["text"].as_str().is_some_and(|t| t.contains(needle))))
            .unwrap_or(false);
        if found {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
