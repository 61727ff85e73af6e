// Main entrypoint for the devstack orchestrator.

use devstack::app;
use devstack::config::{Config, ConfigTrait};
use devstack::shutdown::GracefulShutdown;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const CONFIG_PATH: &str = "cfg/devstack.cfg.yaml";
const CONFIG_PATH_LOCAL: &str = "cfg/devstack.cfg.local.yaml";

/// devstack - local multi-service development orchestrator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Custom config file path
    #[arg(short, long, value_name = "FILE")]
    cfg: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the stack and serve the console (default)
    Up,
    /// Validate the service graph and the gateway rules, then exit
    Check,
    /// Resolve every secret bundle once, then exit
    Secrets,
}

/// Loads the configuration struct from YAML file.
/// Tries local config first, then falls back to default config.
fn load_cfg(path: Option<PathBuf>) -> Result<Config> {
    if let Some(custom_path) = path {
        let cfg = Config::load(&custom_path)
            .with_context(|| format!("failed to load custom config from {:?}", custom_path))?;
        info!(
            component = "config",
            event = "load_success",
            path = ?custom_path,
            "config loaded"
        );
        return Ok(cfg);
    }

    match Config::load(PathBuf::from(CONFIG_PATH_LOCAL)) {
        Ok(cfg) => {
            info!(
                component = "config",
                event = "load_success",
                path = CONFIG_PATH_LOCAL,
                "config loaded"
            );
            Ok(cfg)
        }
        Err(_) => {
            let cfg = Config::load(PathBuf::from(CONFIG_PATH))
                .with_context(|| format!("failed to load config from {}", CONFIG_PATH))?;
            info!(
                component = "config",
                event = "load_success",
                path = CONFIG_PATH,
                "config loaded"
            );
            Ok(cfg)
        }
    }
}

/// Configures structured logging based on configuration.
fn configure_logger(cfg: &Config) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_level = cfg
        .logs()
        .and_then(|logs| logs.level.as_ref())
        .map(|s| s.as_str())
        .unwrap_or("info");

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if cfg.is_prod() {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // The recorder must be installed before the runtime starts.
    if let Err(e) = devstack::metrics::init_prometheus_exporter() {
        eprintln!("Warning: Failed to initialize Prometheus metrics exporter: {}", e);
        eprintln!("Metrics endpoint will not be available");
    }

    tokio::runtime::Runtime::new()
        .context("Failed to create tokio runtime")?
        .block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let cfg = load_cfg(args.cfg)?;
    configure_logger(&cfg);

    match args.command.unwrap_or(Command::Up) {
        Command::Up => up(cfg).await,
        Command::Check => check(&cfg),
        Command::Secrets => secrets(&cfg).await,
    }
}

fn check(cfg: &Config) -> Result<()> {
    let report = app::check(cfg)?;
    for (i, layer) in report.layers.iter().enumerate() {
        println!("layer {}: {}", i, layer.join(", "));
    }
    match report.rules {
        Some(n) => println!("gateway rules: {}", n),
        None => println!("gateway: not configured"),
    }
    Ok(())
}

async fn secrets(cfg: &Config) -> Result<()> {
    let Some((_, report)) = app::resolve_secrets(cfg).await else {
        println!("no secret bundles configured");
        return Ok(());
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_ok() {
        anyhow::bail!("secret bundles failed to resolve: {}", report.failed_names().join(", "));
    }
    Ok(())
}

async fn up(cfg: Config) -> Result<()> {
    let shutdown_token = CancellationToken::new();

    let app = app::App::new(shutdown_token.clone(), cfg).await?;

    let budget = app.shutdown_budget();
    info!(
        component = "main",
        event = "shutdown_budget",
        budget = %humantime::format_duration(budget),
        "graceful shutdown budget computed"
    );
    let graceful_shutdown = GracefulShutdown::new(shutdown_token.clone()).with_timeout(budget);

    app.serve(&graceful_shutdown)?;

    if let Err(e) = graceful_shutdown.await_shutdown().await {
        error!(
            component = "main",
            scope = "service",
            event = "graceful_shutdown_failed",
            error = %e,
            "failed to gracefully shut down stack"
        );
        return Err(e);
    }

    Ok(())
}
