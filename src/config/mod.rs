// Configuration loading and management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PROD: &str = "prod";
#[allow(dead_code)]
pub const DEV: &str = "dev";
#[allow(dead_code)]
pub const TEST: &str = "test";

/// Path served by the gateway for its own readiness probe.
pub const GATEWAY_HEALTH_PATH: &str = "/__devstack/health";

const DEFAULT_GATEWAY_PORT: u16 = 8099;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Devstack {
    #[serde(rename = "devstack")]
    pub stack: StackBox,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StackBox {
    pub env: String,
    /// Prefix used for container names and log fields.
    pub name: Option<String>,
    pub logs: Option<Logs>,
    pub api: Option<Api>,
    pub scheduler: Option<Scheduler>,
    pub gateway: Option<Gateway>,
    pub secrets: Option<Secrets>,
    #[serde(default)]
    pub services: Vec<ServiceDescriptor>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Logs {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Api {
    pub name: Option<String>,
    pub port: Option<String>,
    /// Lines kept per unit for log tails.
    pub log_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Scheduler {
    pub max_concurrent_starts: Option<usize>,
    #[serde(default, with = "humantime_serde")]
    pub shutdown_grace: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub launch_window: Option<Duration>,
}

impl Scheduler {
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace.unwrap_or(Duration::from_secs(10))
    }

    pub fn launch_window(&self) -> Duration {
        self.launch_window.unwrap_or(Duration::from_millis(300))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Gateway {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub rules_path: PathBuf,
    #[serde(default, with = "humantime_serde")]
    pub reload_interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub upstream_timeout: Option<Duration>,
    pub journal_capacity: Option<usize>,
    pub max_body_bytes: Option<usize>,
}

impl Gateway {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_GATEWAY_PORT)
    }

    pub fn bind(&self) -> &str {
        self.bind.as_deref().unwrap_or("0.0.0.0")
    }

    pub fn reload_interval(&self) -> Duration {
        non_zero(self.reload_interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn upstream_timeout(&self) -> Duration {
        non_zero(self.upstream_timeout).unwrap_or(Duration::from_secs(30))
    }

    pub fn journal_capacity(&self) -> usize {
        self.journal_capacity.unwrap_or(1000)
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes.unwrap_or(16 << 20)
    }

    /// Base URL other units use to reach the gateway.
    pub fn local_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretFailurePolicy {
    /// Abort startup naming the failed bundles.
    #[default]
    Abort,
    /// Keep running; units depending on failed bundles stay pending.
    Block,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SecretSourceSpec {
    Kubectl {
        context: Option<String>,
        #[serde(default, with = "humantime_serde")]
        timeout: Option<Duration>,
    },
    File {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Secrets {
    #[serde(default)]
    pub on_failure: SecretFailurePolicy,
    pub source: SecretSourceSpec,
    #[serde(default)]
    pub bundles: Vec<SecretBundle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SecretBundle {
    pub name: String,
    pub namespace: String,
    pub secret: String,
    pub destination: Destination,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Destination {
    pub path: PathBuf,
    /// Text with `{{placeholder}}` markers. Without it the bundle renders as
    /// `PLACEHOLDER=value` lines.
    pub template: Option<String>,
    /// Placeholder name -> key inside the remote secret.
    #[serde(default)]
    pub substitutions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Container,
    Process,
    Gateway,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Container => "container",
            UnitKind::Process => "process",
            UnitKind::Gateway => "gateway",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    Http,
    Tcp,
    Exec,
    Launched,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProbeSpec {
    pub protocol: ProbeProtocol,
    /// URL for http probes, `host:port` for tcp probes.
    pub target: Option<String>,
    pub command: Option<Vec<String>>,
    pub expect_status: Option<u16>,
    #[serde(default, with = "humantime_serde")]
    pub interval: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub initial_delay: Option<Duration>,
    pub success_threshold: Option<u32>,
    pub failure_threshold: Option<u32>,
    pub max_attempts: Option<u32>,
}

/// Zero durations fall back to the default; tokio intervals panic on zero.
fn non_zero(d: Option<Duration>) -> Option<Duration> {
    d.filter(|d| !d.is_zero())
}

/// Rejects an explicitly configured zero duration.
fn require_non_zero(d: Option<Duration>, what: &str) -> Result<()> {
    if d.is_some_and(|d| d.is_zero()) {
        anyhow::bail!("{} must be greater than zero", what);
    }
    Ok(())
}

impl ProbeSpec {
    pub fn launched() -> Self {
        Self {
            protocol: ProbeProtocol::Launched,
            target: None,
            command: None,
            expect_status: None,
            interval: None,
            timeout: None,
            initial_delay: None,
            success_threshold: None,
            failure_threshold: None,
            max_attempts: None,
        }
    }

    pub fn http(target: impl Into<String>) -> Self {
        Self {
            protocol: ProbeProtocol::Http,
            target: Some(target.into()),
            ..Self::launched()
        }
    }

    pub fn interval(&self) -> Duration {
        non_zero(self.interval).unwrap_or(Duration::from_secs(1))
    }

    pub fn timeout(&self) -> Duration {
        non_zero(self.timeout).unwrap_or(Duration::from_secs(2))
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay.unwrap_or(Duration::ZERO)
    }

    pub fn success_threshold(&self) -> u32 {
        self.success_threshold.unwrap_or(1).max(1)
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold.unwrap_or(3).max(1)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(60).max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub kind: UnitKind,
    /// argv for processes; command override for containers.
    pub command: Option<Vec<String>>,
    pub image: Option<String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub env_files: Vec<PathBuf>,
    /// Names of secret bundles whose output this unit reads.
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// `host:container` mappings for containers; informational for processes.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Base URL the unit serves on, usable as a routing rule proxy target.
    pub address: Option<String>,
    pub readiness: Option<ProbeSpec>,
}

impl ServiceDescriptor {
    pub fn probe(&self) -> ProbeSpec {
        self.readiness.clone().unwrap_or_else(ProbeSpec::launched)
    }
}

// Config trait
pub trait ConfigTrait {
    fn logs(&self) -> Option<&Logs>;
    fn is_prod(&self) -> bool;
    #[allow(dead_code)]
    fn is_test(&self) -> bool;
    fn stack_name(&self) -> &str;
    fn api(&self) -> Option<&Api>;
    fn scheduler(&self) -> Scheduler;
    fn gateway(&self) -> Option<&Gateway>;
    fn secrets(&self) -> Option<&Secrets>;
    fn services(&self) -> &[ServiceDescriptor];
    fn service(&self, name: &str) -> Option<&ServiceDescriptor>;
}

// Config type alias for convenience
pub type Config = Devstack;

impl ConfigTrait for Config {
    fn logs(&self) -> Option<&Logs> {
        self.stack.logs.as_ref()
    }

    fn is_prod(&self) -> bool {
        self.stack.env == PROD
    }

    fn is_test(&self) -> bool {
        self.stack.env == TEST
    }

    fn stack_name(&self) -> &str {
        self.stack.name.as_deref().unwrap_or("devstack")
    }

    fn api(&self) -> Option<&Api> {
        self.stack.api.as_ref()
    }

    fn scheduler(&self) -> Scheduler {
        self.stack.scheduler.clone().unwrap_or(Scheduler {
            max_concurrent_starts: None,
            shutdown_grace: None,
            launch_window: None,
        })
    }

    fn gateway(&self) -> Option<&Gateway> {
        self.stack.gateway.as_ref()
    }

    fn secrets(&self) -> Option<&Secrets> {
        self.stack.secrets.as_ref()
    }

    fn services(&self) -> &[ServiceDescriptor] {
        &self.stack.services
    }

    fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.stack.services.iter().find(|s| s.name == name)
    }
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let abs_path = path
            .canonicalize()
            .with_context(|| format!("failed to resolve absolute config filepath: {:?}", path))?;

        let data = std::fs::read_to_string(&abs_path)
            .with_context(|| format!("read config yaml file {:?}", abs_path))?;

        let cfg = Self::parse(&data).with_context(|| format!("load config from {:?}", abs_path))?;
        Ok(cfg)
    }

    /// Parses and post-processes configuration text.
    pub fn parse(data: &str) -> Result<Self> {
        let mut cfg: Config = serde_yaml::from_str(data).context("unmarshal config yaml")?;
        cfg.process()?;
        Ok(cfg)
    }

    fn process(&mut self) -> Result<()> {
        let gateway = self.stack.gateway.clone();
        if let Some(gw) = &gateway {
            require_non_zero(gw.reload_interval, "gateway.reload_interval")?;
            require_non_zero(gw.upstream_timeout, "gateway.upstream_timeout")?;
        }
        let bundle_names: HashSet<String> = self
            .stack
            .secrets
            .as_ref()
            .map(|s| s.bundles.iter().map(|b| b.name.clone()).collect())
            .unwrap_or_default();

        let mut gateway_units = 0usize;
        for svc in self.stack.services.iter_mut() {
            match svc.kind {
                UnitKind::Process => {
                    if svc.command.as_ref().map_or(true, |c| c.is_empty()) {
                        anyhow::bail!("service {:?}: process units require a command", svc.name);
                    }
                }
                UnitKind::Container => {
                    if svc.image.is_none() {
                        anyhow::bail!("service {:?}: container units require an image", svc.name);
                    }
                }
                UnitKind::Gateway => {
                    gateway_units += 1;
                    let gw = gateway.as_ref().with_context(|| {
                        format!("service {:?}: gateway unit declared without a gateway section", svc.name)
                    })?;
                    if svc.readiness.is_none() {
                        svc.readiness = Some(ProbeSpec::http(format!(
                            "{}{}",
                            gw.local_url(),
                            GATEWAY_HEALTH_PATH
                        )));
                    }
                    if svc.address.is_none() {
                        svc.address = Some(gw.local_url());
                    }
                }
            }

            if let Some(probe) = &svc.readiness {
                require_non_zero(probe.interval, &format!("service {:?}: readiness.interval", svc.name))?;
                require_non_zero(probe.timeout, &format!("service {:?}: readiness.timeout", svc.name))?;
                match probe.protocol {
                    ProbeProtocol::Http | ProbeProtocol::Tcp if probe.target.is_none() => {
                        anyhow::bail!("service {:?}: readiness probe requires a target", svc.name);
                    }
                    ProbeProtocol::Exec if probe.command.as_ref().map_or(true, |c| c.is_empty()) => {
                        anyhow::bail!("service {:?}: exec readiness probe requires a command", svc.name);
                    }
                    _ => {}
                }
            }

            for bundle in &svc.secrets {
                if !bundle_names.contains(bundle) {
                    anyhow::bail!("service {:?}: unknown secret bundle {:?}", svc.name, bundle);
                }
            }
        }

        if gateway_units > 1 {
            anyhow::bail!("at most one gateway unit may be declared, found {}", gateway_units);
        }

        Ok(())
    }

    /// Destination file of each secret bundle, keyed by bundle name.
    pub fn bundle_outputs(&self) -> BTreeMap<String, PathBuf> {
        self.stack
            .secrets
            .as_ref()
            .map(|s| {
                s.bundles
                    .iter()
                    .map(|b| (b.name.clone(), b.destination.path.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Base URLs declared by units, keyed by unit name.
    pub fn unit_addresses(&self) -> BTreeMap<String, String> {
        self.stack
            .services
            .iter()
            .filter_map(|s| s.address.clone().map(|a| (s.name.clone(), a)))
            .collect()
    }
}

// Test config is always available for integration tests
mod test_config;
#[allow(dead_code)]
pub use test_config::{new_test_config, process_unit};
