//! Docker container units.
//!
//! Containers are named `<stack>-<unit>`. A stale container with the same name
//! is removed before create so a crashed previous run never blocks a start.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use dashmap::DashMap;
use futures::StreamExt as _;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::{
    LaunchSpec, Launched, LogBuffer, LogHub, LogStream, StopOutcome, Supervisor, SupervisorError,
    UnitExit, DIAGNOSTIC_LINES,
};

const SIGKILL_EXIT_CODE: i64 = 137;
const HOST_GATEWAY: &str = "host.docker.internal:host-gateway";

struct RunningContainer {
    container: String,
    exit: watch::Receiver<Option<UnitExit>>,
}

pub struct ContainerSupervisor {
    docker: Docker,
    prefix: String,
    logs: Arc<LogHub>,
    launch_window: Duration,
    running: DashMap<String, RunningContainer>,
}

/// Splits `host:container[/proto]` into the container port key and host port.
pub fn parse_port_mapping(mapping: &str) -> Option<(String, String)> {
    let (host, container) = mapping.rsplit_once(':')?;
    let (port, proto) = container.split_once('/').unwrap_or((container, "tcp"));
    if host.is_empty() || port.is_empty() {
        return None;
    }
    Some((format!("{}/{}", port, proto), host.to_string()))
}

impl ContainerSupervisor {
    pub fn connect(prefix: &str, logs: Arc<LogHub>, launch_window: Duration) -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            prefix: prefix.to_string(),
            logs,
            launch_window,
            running: DashMap::new(),
        })
    }

    pub fn container_name(&self, unit: &str) -> String {
        format!("{}-{}", self.prefix, unit)
    }

    fn docker_err(unit: &str) -> impl FnOnce(DockerError) -> SupervisorError + '_ {
        move |source| SupervisorError::Docker {
            unit: unit.to_string(),
            source,
        }
    }

    async fn pull_if_missing(&self, unit: &str, image: &str) -> Result<(), SupervisorError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!(component = "supervisor", event = "image_pull", unit = %unit, image = %image, "pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(update) = stream.next().await {
            match update {
                Ok(info) => trace!(unit = %unit, image = %image, "image pull update: {:?}", info),
                Err(e) => {
                    return Err(SupervisorError::LaunchFailed {
                        unit: unit.to_string(),
                        code: None,
                        diagnostics: format!("image pull failed for {}: {}", image, e),
                    });
                }
            }
        }
        Ok(())
    }

    async fn remove_stale(&self, container: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if self.docker.remove_container(container, Some(options)).await.is_ok() {
            debug!(component = "supervisor", event = "stale_container_removed", container = %container, "removed stale container");
        }
    }

    fn container_config(spec: &LaunchSpec, image: &str) -> Config<String> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for mapping in &spec.ports {
            if let Some((key, host_port)) = parse_port_mapping(mapping) {
                exposed_ports.insert(key.clone(), HashMap::new());
                port_bindings.insert(
                    key,
                    Some(vec![PortBinding {
                        host_ip: Some("127.0.0.1".to_string()),
                        host_port: Some(host_port),
                    }]),
                );
            }
        }

        Config {
            image: Some(image.to_string()),
            env: Some(env),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(HostConfig {
                port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
                extra_hosts: Some(vec![HOST_GATEWAY.to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn follow_logs(&self, container: &str, buffer: Arc<LogBuffer>) {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(container, Some(options));
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(LogOutput::StdOut { message }) => push_chunk(&buffer, LogStream::Stdout, &message),
                    Ok(LogOutput::StdErr { message }) => push_chunk(&buffer, LogStream::Stderr, &message),
                    Ok(LogOutput::StdIn { .. }) | Ok(LogOutput::Console { .. }) => {}
                    Err(_) => break,
                }
            }
        });
    }

    fn watch_exit(&self, unit: &str, container: &str, buffer: Arc<LogBuffer>) -> watch::Receiver<Option<UnitExit>> {
        let (tx, rx) = watch::channel(None);
        let docker = self.docker.clone();
        let container = container.to_string();
        let unit = unit.to_string();
        tokio::spawn(async move {
            let options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut stream = docker.wait_container(&container, Some(options));
            let code = match stream.next().await {
                Some(Ok(response)) => Some(response.status_code),
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Some(code),
                Some(Err(e)) => {
                    warn!(component = "supervisor", event = "wait_failed", unit = %unit, error = %e, "container wait failed");
                    None
                }
                None => None,
            };
            let _ = tx.send(Some(UnitExit {
                code,
                diagnostics: buffer.tail_text(DIAGNOSTIC_LINES),
            }));
        });
        rx
    }
}

fn push_chunk(buffer: &LogBuffer, stream: LogStream, chunk: &[u8]) {
    for line in String::from_utf8_lossy(chunk).lines() {
        buffer.push(stream, line);
    }
}

#[async_trait]
impl Supervisor for ContainerSupervisor {
    async fn start(&self, spec: &LaunchSpec) -> Result<Launched, SupervisorError> {
        let image = spec.image.as_deref().ok_or_else(|| SupervisorError::InvalidSpec {
            unit: spec.name.clone(),
            reason: "container unit without an image".to_string(),
        })?;
        let container = self.container_name(&spec.name);

        self.remove_stale(&container).await;
        self.pull_if_missing(&spec.name, image).await?;

        let options = CreateContainerOptions {
            name: container.clone(),
            ..Default::default()
        };
        self.docker
            .create_container(Some(options), Self::container_config(spec, image))
            .await
            .map_err(Self::docker_err(&spec.name))?;
        self.docker
            .start_container::<String>(&container, None)
            .await
            .map_err(Self::docker_err(&spec.name))?;

        let buffer = self.logs.buffer(&spec.name);
        self.follow_logs(&container, buffer.clone());
        let rx = self.watch_exit(&spec.name, &container, buffer);

        self.running.insert(
            spec.name.clone(),
            RunningContainer {
                container: container.clone(),
                exit: rx.clone(),
            },
        );

        let mut window = rx.clone();
        if let Ok(Ok(exit)) = timeout(self.launch_window, window.wait_for(|e| e.is_some())).await {
            let exit = exit.clone();
            if let Some(exit) = exit.filter(|e| !e.success()) {
                self.running.remove(&spec.name);
                return Err(SupervisorError::LaunchFailed {
                    unit: spec.name.clone(),
                    code: exit.code,
                    diagnostics: exit.diagnostics,
                });
            }
        }

        info!(
            component = "supervisor",
            event = "container_launched",
            unit = %spec.name,
            container = %container,
            image = %image,
            "container launched"
        );

        Ok(Launched { pid: None, exit: rx })
    }

    async fn stop(&self, unit: &str, grace: Duration) -> Result<StopOutcome, SupervisorError> {
        let Some((_, mut running)) = self.running.remove(unit) else {
            return Ok(StopOutcome::NotRunning);
        };

        let already_exited = running.exit.borrow().is_some();
        let mut outcome = StopOutcome::AlreadyExited;
        if !already_exited {
            let options = StopContainerOptions {
                t: grace.as_secs().max(1) as i64,
            };
            if let Err(e) = self.docker.stop_container(&running.container, Some(options)).await {
                warn!(component = "supervisor", event = "stop_failed", unit = %unit, error = %e, "container stop failed, forcing removal");
            }
            let exit = timeout(grace + Duration::from_secs(5), running.exit.wait_for(|e| e.is_some()))
                .await
                .ok()
                .and_then(|r| r.ok().and_then(|e| e.clone()));
            outcome = match exit.and_then(|e| e.code) {
                Some(SIGKILL_EXIT_CODE) | None => StopOutcome::Forced,
                Some(_) => StopOutcome::Graceful,
            };
        }

        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&running.container, Some(options))
            .await
            .map_err(Self::docker_err(unit))?;

        info!(
            component = "supervisor",
            event = "container_stopped",
            unit = %unit,
            outcome = outcome.as_str(),
            "container stopped"
        );
        Ok(outcome)
    }

    fn logs(&self, unit: &str) -> Option<Arc<LogBuffer>> {
        self.logs.get(unit)
    }
}
