// Main devstack application implementation.

use anyhow::{Context, Result};
use axum::Router;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigTrait, SecretFailurePolicy, UnitKind};
use crate::controller::{
    GatewayController, HealthController, LogsController, PrometheusMetricsController,
    SecretsController, StatusController,
};
use crate::gateway::{Gateway, GatewayUnit, Journal, RuleContext, RuleStore};
use crate::graph::ServiceGraph;
use crate::http::client::create_client;
use crate::http::{Controller, HttpServer, Middleware};
use crate::middleware::TraceMiddleware;
use crate::probe::ReadinessProber;
use crate::scheduler::{Scheduler, SchedulerHandle, SchedulerOptions};
use crate::secrets::{source_from_config, ResolutionReport, SecretResolver};
use crate::shutdown::GracefulShutdown;
use crate::supervisor::env::GATEWAY_URL_ENV;
use crate::supervisor::logs::DEFAULT_LOG_CAPACITY;
use crate::supervisor::{ContainerSupervisor, LogHub, ProcessSupervisor, StackSupervisor};

/// What `devstack check` reports.
#[derive(Debug)]
pub struct CheckReport {
    pub layers: Vec<Vec<String>>,
    pub rules: Option<usize>,
}

/// Validates the graph and compiles the rules file without starting anything.
pub fn check(cfg: &Config) -> Result<CheckReport> {
    let graph = ServiceGraph::build(cfg.services()).context("invalid service graph")?;
    let rules = match cfg.gateway() {
        Some(gw) => {
            let store = RuleStore::load(&gw.rules_path, rule_context(cfg))
                .with_context(|| format!("invalid rules file {:?}", gw.rules_path))?;
            Some(store.current().len())
        }
        None => None,
    };
    Ok(CheckReport {
        layers: graph.layers(),
        rules,
    })
}

/// Resolves every secret bundle once. Returns `None` when no secrets are
/// configured.
pub async fn resolve_secrets(cfg: &Config) -> Option<(Arc<SecretResolver>, ResolutionReport)> {
    let secrets = cfg.secrets()?;
    let resolver = Arc::new(SecretResolver::new(
        source_from_config(secrets),
        secrets.bundles.clone(),
    ));
    let report = resolver.resolve_all().await;
    Some((resolver, report))
}

fn rule_context(cfg: &Config) -> RuleContext {
    RuleContext {
        addresses: cfg.unit_addresses(),
        base_dir: None,
    }
}

/// Encapsulates the entire stack: scheduler, gateway and console.
pub struct App {
    cfg: Config,
    shutdown_token: CancellationToken,
    graph: Arc<ServiceGraph>,
    rules: Option<Arc<RuleStore>>,
    scheduler: Mutex<Option<Scheduler>>,
    handle: SchedulerHandle,
    server: Arc<HttpServer>,
}

impl App {
    /// Builds the stack. Fails on graph errors, an unloadable rules file, or
    /// unresolved secret bundles under the `abort` policy.
    pub async fn new(shutdown_token: CancellationToken, cfg: Config) -> Result<Self> {
        let graph = Arc::new(ServiceGraph::build(cfg.services()).context("invalid service graph")?);

        let secrets = resolve_secrets(&cfg).await;
        let failed_bundles: HashSet<String> = match &secrets {
            Some((_, report)) if !report.is_ok() => {
                let names = report.failed_names();
                match cfg.secrets().map(|s| s.on_failure).unwrap_or_default() {
                    SecretFailurePolicy::Abort => {
                        anyhow::bail!("secret bundles failed to resolve: {}", names.join(", "));
                    }
                    SecretFailurePolicy::Block => {
                        warn!(
                            component = "app",
                            event = "bundles_blocked",
                            bundles = %names.join(","),
                            "units reading these bundles will stay pending"
                        );
                    }
                }
                names.into_iter().collect()
            }
            _ => HashSet::new(),
        };

        let logs = Arc::new(LogHub::new(
            cfg.api()
                .and_then(|api| api.log_capacity)
                .unwrap_or(DEFAULT_LOG_CAPACITY),
        ));
        let client = create_client();
        let sched_cfg = cfg.scheduler();

        let process = Arc::new(ProcessSupervisor::new(logs.clone(), sched_cfg.launch_window()));
        let mut supervisor = StackSupervisor::new(logs.clone(), process);

        if cfg.services().iter().any(|s| s.kind == UnitKind::Container) {
            let containers = ContainerSupervisor::connect(
                cfg.stack_name(),
                logs.clone(),
                sched_cfg.launch_window(),
            )
            .context("failed to connect to docker")?;
            supervisor = supervisor.with_containers(Arc::new(containers));
        }

        let mut base_env = BTreeMap::new();
        let mut rules = None;
        let mut gateway = None;
        if let Some(gw_cfg) = cfg.gateway() {
            let store = Arc::new(
                RuleStore::load(&gw_cfg.rules_path, rule_context(&cfg))
                    .with_context(|| format!("failed to load rules file {:?}", gw_cfg.rules_path))?,
            );
            let gw = Arc::new(Gateway::new(
                store.clone(),
                Arc::new(Journal::new(gw_cfg.journal_capacity())),
                client.clone(),
                gw_cfg.upstream_timeout(),
                gw_cfg.max_body_bytes(),
            ));
            // The gateway outlives the shutdown signal; the scheduler stops it
            // after the units that depend on it.
            supervisor = supervisor.with_gateway(Arc::new(GatewayUnit::new(
                gw.clone(),
                gw_cfg.bind(),
                gw_cfg.port(),
                logs.clone(),
                CancellationToken::new(),
            )));
            base_env.insert(GATEWAY_URL_ENV.to_string(), gw_cfg.local_url());
            rules = Some(store);
            gateway = Some(gw);
        }

        let scheduler = Scheduler::new(
            graph.clone(),
            Arc::new(supervisor),
            Arc::new(ReadinessProber::new(client)),
            SchedulerOptions {
                max_concurrent_starts: sched_cfg.max_concurrent_starts,
                shutdown_grace: sched_cfg.shutdown_grace(),
                bundle_outputs: cfg.bundle_outputs(),
                failed_bundles,
                base_env,
            },
        );
        let handle = scheduler.handle();

        let mut controllers: Vec<Box<dyn Controller>> = vec![
            Box::new(HealthController::new()),
            Box::new(PrometheusMetricsController::new()),
            Box::new(StatusController::new(cfg.stack_name(), handle.clone())),
            Box::new(LogsController::new(logs, handle.clone())),
        ];
        if let Some(gw) = gateway {
            controllers.push(Box::new(GatewayController::new(gw)));
        }
        if let Some((resolver, _)) = secrets {
            controllers.push(Box::new(SecretsController::new(resolver, handle.clone())));
        }
        let middlewares: Vec<Box<dyn Middleware>> = vec![Box::new(TraceMiddleware::new())];

        let server = HttpServer::new(shutdown_token.clone(), cfg.clone(), controllers, middlewares)?;

        Ok(Self {
            cfg,
            shutdown_token,
            graph,
            rules,
            scheduler: Mutex::new(Some(scheduler)),
            handle,
            server,
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Console router, for in-process requests.
    pub fn console(&self) -> Router {
        self.server.router()
    }

    /// Upper bound for a graceful stop: one grace period per layer plus slack.
    pub fn shutdown_budget(&self) -> Duration {
        let layers = self.graph.layers().len() as u32;
        self.cfg.scheduler().shutdown_grace() * (layers + 1) + Duration::from_secs(5)
    }

    /// Spawns the scheduler, the rules watcher and the console server.
    /// Each task reports to `gsh` when it finishes.
    pub fn serve(&self, gsh: &GracefulShutdown) -> Result<()> {
        let scheduler = self
            .scheduler
            .lock()
            .take()
            .context("application is already serving")?;

        gsh.add(1);
        let token = self.shutdown_token.clone();
        let done = gsh.clone();
        tokio::spawn(async move {
            scheduler.run(token).await;
            done.done();
        });

        if let (Some(store), Some(gw_cfg)) = (self.rules.clone(), self.cfg.gateway()) {
            gsh.add(1);
            let token = self.shutdown_token.clone();
            let every = gw_cfg.reload_interval();
            let done = gsh.clone();
            tokio::spawn(async move {
                store.watch(every, token).await;
                done.done();
            });
        }

        gsh.add(1);
        let server = self.server.clone();
        let token = self.shutdown_token.clone();
        let done = gsh.clone();
        tokio::spawn(async move {
            if let Err(e) = server.listen_and_serve().await {
                error!(
                    component = "app",
                    scope = "server",
                    event = "serve_failed",
                    error = %e,
                    "console failed to serve"
                );
                token.cancel();
            }
            done.done();
        });

        info!(
            component = "app",
            event = "started",
            stack = self.cfg.stack_name(),
            units = self.graph.len(),
            "application lifecycle"
        );
        Ok(())
    }
}
