//! OS process units.
//!
//! Each unit runs in its own process group so a stop reaches every child it
//! forked. Stop sends SIGTERM to the group, waits the grace period, then
//! sends SIGKILL.

use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{
    LaunchSpec, Launched, LogBuffer, LogHub, LogStream, StopOutcome, Supervisor, SupervisorError,
    UnitExit, DIAGNOSTIC_LINES,
};

const KILL_WAIT: Duration = Duration::from_secs(5);
const PUMP_DRAIN: Duration = Duration::from_millis(200);

struct RunningProcess {
    pid: u32,
    exit: watch::Receiver<Option<UnitExit>>,
}

pub struct ProcessSupervisor {
    logs: Arc<LogHub>,
    launch_window: Duration,
    running: DashMap<String, RunningProcess>,
}

impl ProcessSupervisor {
    pub fn new(logs: Arc<LogHub>, launch_window: Duration) -> Self {
        Self {
            logs,
            launch_window,
            running: DashMap::new(),
        }
    }

    pub fn is_tracked(&self, unit: &str) -> bool {
        self.running.contains_key(unit)
    }
}

fn pump<R>(reader: R, buffer: Arc<LogBuffer>, stream: LogStream) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            buffer.push(stream, line);
        }
    })
}

fn signal_group(unit: &str, pid: u32, signal: libc::c_int) -> Result<bool, SupervisorError> {
    // SAFETY: kill(2) with a negative pid targets the process group created at spawn.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(SupervisorError::Signal {
        unit: unit.to_string(),
        source: err,
    })
}

async fn wait_exit(rx: &mut watch::Receiver<Option<UnitExit>>, limit: Duration) -> bool {
    matches!(timeout(limit, rx.wait_for(|e| e.is_some())).await, Ok(Ok(_)))
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn start(&self, spec: &LaunchSpec) -> Result<Launched, SupervisorError> {
        let Some((program, args)) = spec.command.split_first() else {
            return Err(SupervisorError::InvalidSpec {
                unit: spec.name.clone(),
                reason: "empty command".to_string(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            unit: spec.name.clone(),
            source,
        })?;
        let pid = child.id().ok_or_else(|| SupervisorError::LaunchFailed {
            unit: spec.name.clone(),
            code: None,
            diagnostics: "process exited before its pid was read".to_string(),
        })?;

        let buffer = self.logs.buffer(&spec.name);
        let mut pumps = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            pumps.push(pump(out, buffer.clone(), LogStream::Stdout));
        }
        if let Some(err) = child.stderr.take() {
            pumps.push(pump(err, buffer.clone(), LogStream::Stderr));
        }

        let (tx, rx) = watch::channel(None);
        let unit = spec.name.clone();
        let waiter_buffer = buffer.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().map(i64::from),
                Err(e) => {
                    warn!(component = "supervisor", event = "wait_failed", unit = %unit, error = %e, "process wait failed");
                    None
                }
            };
            // Give the pumps a moment to flush the last lines into the buffer.
            let _ = timeout(PUMP_DRAIN, futures::future::join_all(pumps)).await;
            let exit = UnitExit {
                code,
                diagnostics: waiter_buffer.tail_text(DIAGNOSTIC_LINES),
            };
            debug!(component = "supervisor", event = "process_exited", unit = %unit, code = ?exit.code, "process exited");
            let _ = tx.send(Some(exit));
        });

        self.running.insert(
            spec.name.clone(),
            RunningProcess {
                pid,
                exit: rx.clone(),
            },
        );

        let mut window = rx.clone();
        if wait_exit(&mut window, self.launch_window).await {
            let exit = window.borrow().clone();
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
            event = "process_launched",
            unit = %spec.name,
            pid = pid,
            "process launched"
        );

        Ok(Launched {
            pid: Some(pid),
            exit: rx,
        })
    }

    async fn stop(&self, unit: &str, grace: Duration) -> Result<StopOutcome, SupervisorError> {
        let Some((_, mut proc)) = self.running.remove(unit) else {
            return Ok(StopOutcome::NotRunning);
        };

        if proc.exit.borrow().is_some() {
            return Ok(StopOutcome::AlreadyExited);
        }

        if !signal_group(unit, proc.pid, libc::SIGTERM)? {
            return Ok(StopOutcome::AlreadyExited);
        }

        if wait_exit(&mut proc.exit, grace).await {
            info!(component = "supervisor", event = "process_stopped", unit = %unit, outcome = "graceful", "process stopped");
            return Ok(StopOutcome::Graceful);
        }

        warn!(
            component = "supervisor",
            event = "process_killed",
            unit = %unit,
            grace_ms = grace.as_millis() as u64,
            "process ignored SIGTERM, sending SIGKILL"
        );
        signal_group(unit, proc.pid, libc::SIGKILL)?;
        wait_exit(&mut proc.exit, KILL_WAIT).await;
        Ok(StopOutcome::Forced)
    }

    fn logs(&self, unit: &str) -> Option<Arc<LogBuffer>> {
        self.logs.get(unit)
    }
}
