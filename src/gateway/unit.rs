//! The gateway as a supervised unit of the stack.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::gateway::Gateway;
use crate::supervisor::{
    LaunchSpec, Launched, LogBuffer, LogHub, LogStream, StopOutcome, Supervisor, SupervisorError,
    UnitExit,
};

struct Serving {
    unit: String,
    token: CancellationToken,
    exit: watch::Receiver<Option<UnitExit>>,
    task: JoinHandle<()>,
}

/// Serves the gateway router on its own listener while the unit is running.
pub struct GatewayUnit {
    gateway: Arc<Gateway>,
    addr: String,
    logs: Arc<LogHub>,
    shutdown: CancellationToken,
    serving: Mutex<Option<Serving>>,
}

impl GatewayUnit {
    pub fn new(
        gateway: Arc<Gateway>,
        bind: &str,
        port: u16,
        logs: Arc<LogHub>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            addr: format!("{}:{}", bind, port),
            logs,
            shutdown,
            serving: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Supervisor for GatewayUnit {
    async fn start(&self, spec: &LaunchSpec) -> Result<Launched, SupervisorError> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|source| SupervisorError::Spawn {
                unit: spec.name.clone(),
                source,
            })?;

        let buffer = self.logs.buffer(&spec.name);
        buffer.push(LogStream::Stdout, format!("gateway listening on {}", self.addr));

        let token = self.shutdown.child_token();
        let (tx, rx) = watch::channel(None);
        let router = self.gateway.clone().router();
        let serve_token = token.clone();
        let serve_buffer = buffer.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { serve_token.cancelled().await })
                .await;
            let exit = match result {
                Ok(()) => UnitExit {
                    code: Some(0),
                    diagnostics: String::new(),
                },
                Err(e) => {
                    serve_buffer.push(LogStream::Stderr, format!("gateway server failed: {}", e));
                    UnitExit {
                        code: Some(1),
                        diagnostics: e.to_string(),
                    }
                }
            };
            let _ = tx.send(Some(exit));
        });

        info!(
            component = "gateway",
            event = "started",
            unit = %spec.name,
            addr = %self.addr,
            "gateway unit started"
        );

        *self.serving.lock() = Some(Serving {
            unit: spec.name.clone(),
            token,
            exit: rx.clone(),
            task,
        });

        Ok(Launched { pid: None, exit: rx })
    }

    async fn stop(&self, unit: &str, grace: Duration) -> Result<StopOutcome, SupervisorError> {
        let serving = {
            let mut guard = self.serving.lock();
            match guard.as_ref() {
                Some(s) if s.unit == unit => guard.take(),
                _ => None,
            }
        };
        let Some(mut serving) = serving else {
            return Ok(StopOutcome::NotRunning);
        };

        if serving.exit.borrow().is_some() {
            return Ok(StopOutcome::AlreadyExited);
        }

        serving.token.cancel();
        let stopped = matches!(
            timeout(grace, serving.exit.wait_for(|e| e.is_some())).await,
            Ok(Ok(_))
        );
        if stopped {
            return Ok(StopOutcome::Graceful);
        }

        serving.task.abort();
        Ok(StopOutcome::Forced)
    }

    fn logs(&self, unit: &str) -> Option<Arc<LogBuffer>> {
        self.logs.get(unit)
    }
}
