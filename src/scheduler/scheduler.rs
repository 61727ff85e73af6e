//! Dependency scheduler.
//!
//! One task owns every lifecycle decision. Launches, probes, exits and
//! operator actions run elsewhere and report back as [`Event`]s tagged with
//! the unit epoch they belong to; events from an older epoch are dropped.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::readiness::{monitor_health, poll_until_ready, ReadinessOutcome};
use super::state::{StateChange, UnitTable};
use super::SchedulerError;
use crate::config::ProbeProtocol;
use crate::graph::ServiceGraph;
use crate::metrics;
use crate::model::{BlockedBy, DegradedReason, LifecycleState, ProbeResult, UnitStatus};
use crate::probe::{ProbeOutcome, Prober};
use crate::supervisor::{build_launch_spec, Launched, Supervisor, UnitExit};

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Upper bound on units in Starting or AwaitingReady. `None` or zero
    /// means unbounded.
    pub max_concurrent_starts: Option<usize>,
    pub shutdown_grace: Duration,
    /// Secret bundle name -> rendered env file.
    pub bundle_outputs: BTreeMap<String, PathBuf>,
    /// Bundles that failed to resolve; units reading them stay Pending.
    pub failed_bundles: HashSet<String>,
    /// Environment every unit starts from.
    pub base_env: BTreeMap<String, String>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_starts: None,
            shutdown_grace: Duration::from_secs(10),
            bundle_outputs: BTreeMap::new(),
            failed_bundles: HashSet::new(),
            base_env: BTreeMap::new(),
        }
    }
}

enum Event {
    Launched {
        unit: String,
        epoch: u64,
        launched: Launched,
    },
    LaunchFailed {
        unit: String,
        epoch: u64,
        error: String,
    },
    Probe {
        unit: String,
        epoch: u64,
        attempt: u32,
        outcome: ProbeOutcome,
    },
    ReadinessDone {
        unit: String,
        epoch: u64,
        outcome: ReadinessOutcome,
    },
    Health {
        unit: String,
        epoch: u64,
        healthy: bool,
    },
    Recovery {
        unit: String,
        epoch: u64,
        outcome: ProbeOutcome,
    },
    Exited {
        unit: String,
        epoch: u64,
        exit: UnitExit,
    },
    Restart {
        unit: String,
        reply: oneshot::Sender<Result<(), SchedulerError>>,
    },
    StopCompleted {
        unit: String,
    },
    BundlesChanged {
        failed: HashSet<String>,
    },
}

/// Cheap, cloneable access to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    table: Arc<UnitTable>,
    events: mpsc::UnboundedSender<Event>,
}

impl SchedulerHandle {
    pub fn status(&self) -> Vec<UnitStatus> {
        self.table.snapshot()
    }

    pub fn unit(&self, name: &str) -> Option<UnitStatus> {
        self.table.status(name)
    }

    pub fn state(&self, name: &str) -> Option<LifecycleState> {
        self.table.state(name)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.table.subscribe()
    }

    /// Requests a partial restart. Returns once the scheduler accepted or
    /// rejected it; the unit comes back through the normal start path.
    pub async fn restart(&self, name: &str) -> Result<(), SchedulerError> {
        if !self.table.contains(name) {
            return Err(SchedulerError::UnknownUnit(name.to_string()));
        }
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Restart {
                unit: name.to_string(),
                reply,
            })
            .map_err(|_| SchedulerError::NotRunning)?;
        rx.await.map_err(|_| SchedulerError::NotRunning)?
    }

    /// Replaces the set of unresolved bundles, e.g. after a secrets refresh.
    pub fn set_failed_bundles(&self, failed: HashSet<String>) -> Result<(), SchedulerError> {
        self.events
            .send(Event::BundlesChanged { failed })
            .map_err(|_| SchedulerError::NotRunning)
    }
}

struct Active {
    epoch: u64,
    token: CancellationToken,
    started: Instant,
    start: Option<JoinHandle<()>>,
}

pub struct Scheduler {
    graph: Arc<ServiceGraph>,
    order: Vec<String>,
    table: Arc<UnitTable>,
    supervisor: Arc<dyn Supervisor>,
    prober: Arc<dyn Prober>,
    opts: SchedulerOptions,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    active: HashMap<String, Active>,
    restarting: HashSet<String>,
    units_token: CancellationToken,
}

impl Scheduler {
    pub fn new(
        graph: Arc<ServiceGraph>,
        supervisor: Arc<dyn Supervisor>,
        prober: Arc<dyn Prober>,
        opts: SchedulerOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let table = Arc::new(UnitTable::new(graph.descriptors()));
        let order = graph.layers().into_iter().flatten().collect();
        Self {
            graph,
            order,
            table,
            supervisor,
            prober,
            opts,
            tx,
            rx,
            active: HashMap::new(),
            restarting: HashSet::new(),
            units_token: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            table: self.table.clone(),
            events: self.tx.clone(),
        }
    }

    /// Runs the decision loop until `shutdown` fires, then stops every live
    /// unit in reverse dependency order.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            component = "scheduler",
            event = "started",
            units = self.graph.len(),
            layers = self.graph.layers().len(),
            "scheduler started"
        );

        self.pass();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = self.rx.recv() => {
                    self.handle_event(event);
                    self.pass();
                }
            }
        }

        self.shutdown().await;
    }

    /// Starts every Pending unit whose dependencies are Ready and whose
    /// bundles resolved, within the concurrency limit.
    fn pass(&mut self) {
        let limit = match self.opts.max_concurrent_starts {
            Some(n) if n > 0 => n,
            _ => usize::MAX,
        };
        let mut launching = self
            .order
            .iter()
            .filter(|n| self.table.read(n, |u| u.state.is_launching()).unwrap_or(false))
            .count();

        for name in self.order.clone() {
            if self.table.state(&name) != Some(LifecycleState::Pending) {
                continue;
            }
            let blocked = self.blocker(&name);
            self.table.update(&name, |u| u.blocked_by = blocked.clone());
            if blocked.is_some() || !self.deps_ready(&name) || launching >= limit {
                continue;
            }
            self.start(&name);
            launching += 1;
        }
    }

    fn blocker(&self, name: &str) -> Option<BlockedBy> {
        let desc = self.graph.descriptor(name)?;
        if let Some(bundle) = desc
            .secrets
            .iter()
            .find(|b| self.opts.failed_bundles.contains(*b))
        {
            return Some(BlockedBy::Bundle(bundle.clone()));
        }
        self.graph.dependencies(name).into_iter().find_map(|dep| {
            self.table
                .read(&dep, |u| {
                    let blocked = u.state == LifecycleState::Failed
                        || (u.state == LifecycleState::Pending && u.blocked_by.is_some());
                    blocked.then(|| BlockedBy::Dependency(dep.clone()))
                })
                .flatten()
        })
    }

    fn deps_ready(&self, name: &str) -> bool {
        self.graph
            .dependencies(name)
            .iter()
            .all(|dep| self.table.is_ready(dep))
    }

    fn is_current(&self, unit: &str, epoch: u64) -> bool {
        self.active.get(unit).map_or(false, |a| a.epoch == epoch)
    }

    fn start(&mut self, name: &str) {
        let Some(desc) = self.graph.descriptor(name).cloned() else {
            return;
        };
        if let Err(e) = self.table.transition(name, LifecycleState::Starting) {
            warn!(component = "scheduler", event = "start_skipped", unit = name, error = %e, "unit not startable");
            return;
        }
        let epoch = self
            .table
            .update(name, |u| {
                u.epoch += 1;
                u.blocked_by = None;
                u.last_probe = None;
                u.epoch
            })
            .unwrap_or_default();

        let spec = match build_launch_spec(&desc, &self.opts.bundle_outputs, &self.opts.base_env) {
            Ok(spec) => spec,
            Err(e) => {
                self.fail(name, e.to_string());
                return;
            }
        };

        info!(
            component = "scheduler",
            event = "starting",
            unit = name,
            kind = desc.kind.as_str(),
            epoch,
            "starting unit"
        );

        let supervisor = self.supervisor.clone();
        let tx = self.tx.clone();
        let unit = name.to_string();
        let start = tokio::spawn(async move {
            let event = match supervisor.start(&spec).await {
                Ok(launched) => Event::Launched {
                    unit,
                    epoch,
                    launched,
                },
                Err(e) => Event::LaunchFailed {
                    unit,
                    epoch,
                    error: e.to_string(),
                },
            };
            let _ = tx.send(event);
        });

        self.active.insert(
            name.to_string(),
            Active {
                epoch,
                token: self.units_token.child_token(),
                started: Instant::now(),
                start: Some(start),
            },
        );
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Launched {
                unit,
                epoch,
                launched,
            } => self.on_launched(unit, epoch, launched),
            Event::LaunchFailed { unit, epoch, error } => {
                if self.is_current(&unit, epoch) && self.table.state(&unit) == Some(LifecycleState::Starting) {
                    self.fail(&unit, error);
                }
            }
            Event::Probe {
                unit,
                epoch,
                attempt,
                outcome,
            } => {
                if self.is_current(&unit, epoch) {
                    self.record_probe(&unit, attempt, &outcome);
                    if outcome.ok {
                        self.promote_recovered(&unit);
                    }
                }
            }
            Event::ReadinessDone { unit, epoch, outcome } => {
                if self.is_current(&unit, epoch) {
                    self.on_readiness(unit, epoch, outcome);
                }
            }
            Event::Health { unit, epoch, healthy } => {
                if self.is_current(&unit, epoch) {
                    self.on_health(&unit, healthy);
                }
            }
            Event::Recovery { unit, epoch, outcome } => {
                if self.is_current(&unit, epoch) {
                    self.on_recovery(&unit, outcome);
                }
            }
            Event::Exited { unit, epoch, exit } => {
                if self.is_current(&unit, epoch) {
                    self.on_exit(&unit, exit);
                }
            }
            Event::Restart { unit, reply } => {
                let _ = reply.send(self.restart(&unit));
            }
            Event::StopCompleted { unit } => {
                if self.restarting.remove(&unit) && self.table.transition(&unit, LifecycleState::Pending).is_ok() {
                    self.table.update(&unit, |u| u.restarts += 1);
                }
            }
            Event::BundlesChanged { failed } => {
                info!(
                    component = "scheduler",
                    event = "bundles_changed",
                    failed = failed.len(),
                    "unresolved bundle set updated"
                );
                self.opts.failed_bundles = failed;
            }
        }
    }

    fn on_launched(&mut self, unit: String, epoch: u64, launched: Launched) {
        if !self.is_current(&unit, epoch) || self.table.state(&unit) != Some(LifecycleState::Starting) {
            debug!(component = "scheduler", event = "stale_launch", unit = %unit, epoch, "ignoring superseded launch");
            return;
        }
        let Some(token) = self.active.get_mut(&unit).map(|a| {
            a.start = None;
            a.token.clone()
        }) else {
            return;
        };
        if self.table.transition(&unit, LifecycleState::AwaitingReady).is_err() {
            return;
        }
        info!(
            component = "scheduler",
            event = "launched",
            unit = %unit,
            pid = ?launched.pid,
            "unit launched, awaiting readiness"
        );

        let tx = self.tx.clone();
        let exit_unit = unit.clone();
        let exit_token = token.clone();
        let mut exit = launched.exit;
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = exit_token.cancelled() => {}
                seen = async { exit.wait_for(|e| e.is_some()).await.ok().and_then(|e| e.clone()) } => {
                    let exit = seen.unwrap_or(UnitExit {
                        code: None,
                        diagnostics: "supervisor dropped the exit channel".to_string(),
                    });
                    let _ = tx.send(Event::Exited { unit: exit_unit, epoch, exit });
                }
            }
        });

        let Some(desc) = self.graph.descriptor(&unit).cloned() else {
            return;
        };
        let prober = self.prober.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let spec = desc.probe();
            let report_tx = tx.clone();
            let outcome = poll_until_ready(&*prober, &unit, &spec, &token, |attempt, outcome| {
                let _ = report_tx.send(Event::Probe {
                    unit: unit.clone(),
                    epoch,
                    attempt,
                    outcome: outcome.clone(),
                });
            })
            .await;
            let _ = tx.send(Event::ReadinessDone { unit, epoch, outcome });
        });
    }

    fn record_probe(&self, unit: &str, attempt: u32, outcome: &ProbeOutcome) {
        metrics::record_probe(unit, outcome.ok);
        self.table.update(unit, |u| {
            u.last_probe = Some(ProbeResult {
                at: Utc::now(),
                ok: outcome.ok,
                detail: outcome.detail.clone(),
                attempt,
            })
        });
    }

    fn on_readiness(&mut self, unit: String, epoch: u64, outcome: ReadinessOutcome) {
        if self.table.state(&unit) != Some(LifecycleState::AwaitingReady) {
            return;
        }
        match outcome {
            ReadinessOutcome::Ready => {
                if self.table.transition(&unit, LifecycleState::Ready).is_err() {
                    return;
                }
                let elapsed = self.active.get(&unit).map(|a| a.started.elapsed());
                info!(
                    component = "scheduler",
                    event = "ready",
                    unit = %unit,
                    elapsed = ?elapsed,
                    "unit ready"
                );
                self.spawn_monitor(&unit, epoch);
                self.recover_dependents(&unit);
            }
            ReadinessOutcome::Exhausted { attempts, detail } => {
                self.fail(
                    &unit,
                    format!("readiness probe failed after {} attempts: {}", attempts, detail),
                );
            }
            ReadinessOutcome::Cancelled => {}
        }
    }

    fn spawn_monitor(&self, unit: &str, epoch: u64) {
        let Some(desc) = self.graph.descriptor(unit).cloned() else {
            return;
        };
        let spec = desc.probe();
        // Exits are reported by the supervisor; a launched probe has nothing to watch.
        if spec.protocol == ProbeProtocol::Launched {
            return;
        }
        let Some(token) = self.active.get(unit).map(|a| a.token.clone()) else {
            return;
        };
        let prober = self.prober.clone();
        let tx = self.tx.clone();
        let unit = unit.to_string();
        tokio::spawn(async move {
            monitor_health(&*prober, &unit, &spec, &token, |attempt, outcome, changed| {
                let _ = tx.send(Event::Probe {
                    unit: unit.clone(),
                    epoch,
                    attempt,
                    outcome: outcome.clone(),
                });
                if let Some(healthy) = changed {
                    let _ = tx.send(Event::Health {
                        unit: unit.clone(),
                        epoch,
                        healthy,
                    });
                }
            })
            .await;
        });
    }

    fn on_health(&mut self, unit: &str, healthy: bool) {
        let Some(state) = self.table.state(unit) else {
            return;
        };
        match (healthy, state) {
            (false, LifecycleState::Ready)
            | (false, LifecycleState::Degraded(DegradedReason::Dependency(_))) => {
                warn!(component = "scheduler", event = "probe_failing", unit, "ready unit failing its probe");
                let _ = self
                    .table
                    .transition(unit, LifecycleState::Degraded(DegradedReason::ProbeFailing));
            }
            (true, LifecycleState::Degraded(DegradedReason::ProbeFailing)) => {
                let next = match self.first_unready_dep(unit) {
                    Some(dep) => LifecycleState::Degraded(DegradedReason::Dependency(dep)),
                    None => LifecycleState::Ready,
                };
                let recovered = next.is_ready();
                if self.table.transition(unit, next).is_ok() && recovered {
                    info!(component = "scheduler", event = "probe_recovered", unit, "unit healthy again");
                    self.recover_dependents(unit);
                }
            }
            _ => {}
        }
    }

    fn first_unready_dep(&self, unit: &str) -> Option<String> {
        self.graph
            .dependencies(unit)
            .into_iter()
            .find(|dep| !self.table.is_ready(dep))
    }

    /// Re-probes once every dependent degraded by a dependency whose own
    /// dependencies are all Ready again.
    fn recover_dependents(&self, unit: &str) {
        for dependent in self.graph.dependents(unit) {
            if !self.recoverable(&dependent) {
                continue;
            }
            let (Some(active), Some(desc)) = (
                self.active.get(&dependent),
                self.graph.descriptor(&dependent).cloned(),
            ) else {
                continue;
            };
            let epoch = active.epoch;
            let prober = self.prober.clone();
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let outcome = prober.check(&dependent, &desc.probe()).await;
                let _ = tx.send(Event::Recovery {
                    unit: dependent,
                    epoch,
                    outcome,
                });
            });
        }
    }

    fn on_recovery(&mut self, unit: &str, outcome: ProbeOutcome) {
        self.record_probe(unit, 0, &outcome);
        if outcome.ok {
            self.promote_recovered(unit);
            return;
        }
        if self.recoverable(unit) {
            // The health monitor keeps probing and promotes on its next pass.
            info!(
                component = "scheduler",
                event = "recovery_probe_failed",
                unit,
                detail = %outcome.detail,
                "dependencies ready again but unit still failing"
            );
        }
    }

    /// Degraded by a dependency that is Ready again.
    fn recoverable(&self, unit: &str) -> bool {
        matches!(
            self.table.state(unit),
            Some(LifecycleState::Degraded(DegradedReason::Dependency(_)))
        ) && self.deps_ready(unit)
    }

    /// Moves a recoverable unit back to Ready after a passing probe.
    fn promote_recovered(&mut self, unit: &str) {
        if !self.recoverable(unit) {
            return;
        }
        if self.table.transition(unit, LifecycleState::Ready).is_ok() {
            info!(component = "scheduler", event = "dependency_recovered", unit, "unit ready again");
            self.recover_dependents(unit);
        }
    }

    fn on_exit(&mut self, unit: &str, exit: UnitExit) {
        let Some(state) = self.table.state(unit) else {
            return;
        };
        match state {
            LifecycleState::Starting | LifecycleState::AwaitingReady => {
                self.fail(unit, exit.to_string());
            }
            LifecycleState::Ready | LifecycleState::Degraded(_) => {
                if state == LifecycleState::Degraded(DegradedReason::Exited) {
                    return;
                }
                warn!(
                    component = "scheduler",
                    event = "exited",
                    unit,
                    exit = %exit,
                    "unit exited unexpectedly"
                );
                if self
                    .table
                    .transition(unit, LifecycleState::Degraded(DegradedReason::Exited))
                    .is_err()
                {
                    return;
                }
                self.table.update(unit, |u| u.last_exit = Some(exit.to_string()));
                if let Some(active) = self.active.remove(unit) {
                    active.token.cancel();
                }
                self.spawn_stop(unit, false);
                self.degrade_dependents(unit);
            }
            _ => {}
        }
    }

    /// Direct dependents that are Ready become Degraded(Dependency). Nothing
    /// further down the graph is touched.
    fn degrade_dependents(&self, unit: &str) {
        for dependent in self.graph.dependents(unit) {
            if !self.table.is_ready(&dependent) {
                continue;
            }
            warn!(
                component = "scheduler",
                event = "dependency_degraded",
                unit = %dependent,
                dependency = unit,
                "dependency no longer ready"
            );
            let _ = self.table.transition(
                &dependent,
                LifecycleState::Degraded(DegradedReason::Dependency(unit.to_string())),
            );
        }
    }

    /// Terminal for this run: records diagnostics, cancels pollers and
    /// releases whatever the supervisor still holds.
    fn fail(&mut self, unit: &str, reason: String) {
        error!(
            component = "scheduler",
            event = "failed",
            unit,
            reason = %reason,
            "unit failed"
        );
        if self.table.transition(unit, LifecycleState::Failed).is_ok() {
            self.table.update(unit, |u| u.last_exit = Some(reason));
        }
        if let Some(active) = self.active.remove(unit) {
            active.token.cancel();
        }
        self.spawn_stop(unit, false);
    }

    fn restart(&mut self, unit: &str) -> Result<(), SchedulerError> {
        let state = self
            .table
            .state(unit)
            .ok_or_else(|| SchedulerError::UnknownUnit(unit.to_string()))?;

        match state {
            LifecycleState::Ready | LifecycleState::Degraded(_) | LifecycleState::Failed => {}
            LifecycleState::Stopped if !self.restarting.contains(unit) => {
                self.table.transition(unit, LifecycleState::Pending)?;
                self.table.update(unit, |u| u.restarts += 1);
                return Ok(());
            }
            other => {
                return Err(SchedulerError::RestartNotAllowed {
                    unit: unit.to_string(),
                    state: other.to_string(),
                })
            }
        }

        info!(
            component = "scheduler",
            event = "restart",
            unit,
            from = %state,
            "restarting unit"
        );
        self.degrade_dependents(unit);
        if let Some(active) = self.active.remove(unit) {
            active.token.cancel();
        }
        self.table.transition(unit, LifecycleState::Stopped)?;
        self.restarting.insert(unit.to_string());
        self.spawn_stop(unit, true);
        Ok(())
    }

    fn spawn_stop(&self, unit: &str, notify: bool) {
        let supervisor = self.supervisor.clone();
        let grace = self.opts.shutdown_grace;
        let tx = self.tx.clone();
        let unit = unit.to_string();
        tokio::spawn(async move {
            log_stop(&unit, supervisor.stop(&unit, grace).await);
            if notify {
                let _ = tx.send(Event::StopCompleted { unit });
            }
        });
    }

    async fn shutdown(mut self) {
        info!(component = "scheduler", event = "shutdown", "stopping units in reverse dependency order");
        self.units_token.cancel();

        // Let in-flight launches settle so their units can be stopped.
        for active in self.active.values_mut() {
            if let Some(start) = active.start.take() {
                let _ = timeout(self.opts.shutdown_grace, start).await;
            }
        }

        for layer in self.graph.shutdown_order() {
            let stops = layer
                .into_iter()
                .filter(|name| self.table.read(name, |u| u.state.is_running()).unwrap_or(false))
                .map(|name| {
                    let supervisor = self.supervisor.clone();
                    let grace = self.opts.shutdown_grace;
                    async move {
                        let result = supervisor.stop(&name, grace).await;
                        (name, result)
                    }
                });
            for (name, result) in futures::future::join_all(stops).await {
                log_stop(&name, result);
                let _ = self.table.transition(&name, LifecycleState::Stopped);
            }
        }

        // Units that never started are reset too; Failed keeps its diagnostics.
        for name in self.graph.names() {
            if self.table.state(&name) == Some(LifecycleState::Pending) {
                self.table.update(&name, |u| u.blocked_by = None);
                let _ = self.table.transition(&name, LifecycleState::Stopped);
            }
        }

        info!(component = "scheduler", event = "stopped", "scheduler stopped");
    }
}

fn log_stop(unit: &str, result: Result<crate::supervisor::StopOutcome, crate::supervisor::SupervisorError>) {
    match result {
        Ok(outcome) => info!(
            component = "scheduler",
            event = "unit_stopped",
            unit,
            outcome = outcome.as_str(),
            "unit stopped"
        ),
        Err(e) => warn!(
            component = "scheduler",
            event = "stop_failed",
            unit,
            error = %e,
            "unit stop failed"
        ),
    }
}
