//! # rollout
//!
//! Deployment trigger service: accepts deploy requests over HTTP, runs at
//! most one release per service at a time, and records every lifecycle
//! event in an append-only log.

#![deny(unsafe_code)]

mod crash;
mod lifecycle;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use rollout_engine::{
    Notifier, RancherEnv, ReleaseConfig, ReleaseExecutor, ServiceRegistry, TriggerController,
};
use rollout_server::shutdown::wait_for_signal;
use rollout_server::{AppState, ServerConfig, ShutdownCoordinator};
use rollout_settings::Settings;
use rollout_store::{EventLog, LogConfig};
use rollout_telemetry::{LogFormat, TelemetryConfig};

/// Coalescing deployment trigger service.
#[derive(Parser, Debug)]
#[command(name = "rollout", about = "Coalescing deployment trigger service")]
struct Cli {
    /// Settings file (default `~/.rollout/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Path to the event log database.
    #[arg(long)]
    data: Option<PathBuf>,

    /// Default log level (`error`, `warn`, `info`, `debug`, `trace`).
    #[arg(long)]
    log_level: Option<String>,

    /// Human-readable logs instead of JSON lines.
    #[arg(long)]
    pretty: bool,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(data) = &self.data {
            settings.log.path = data.to_string_lossy().into_owned();
        }
        if let Some(level) = &self.log_level {
            settings.logging.level = level.clone();
        }
        if self.pretty {
            settings.logging.json = false;
        }
    }
}

fn telemetry_config(settings: &Settings) -> TelemetryConfig {
    let parse = |raw: &str| rollout_telemetry::parse_level(raw).unwrap_or(tracing::Level::INFO);
    TelemetryConfig {
        log_level: parse(&settings.logging.level),
        module_levels: settings
            .logging
            .modules
            .iter()
            .map(|(module, level)| (module.clone(), parse(level)))
            .collect(),
        format: if settings.logging.json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
    }
}

fn log_config(settings: &Settings) -> LogConfig {
    LogConfig {
        durability: match settings.log.durability {
            rollout_settings::Durability::Normal => rollout_store::Durability::Normal,
            rollout_settings::Durability::Full => rollout_store::Durability::Full,
        },
        reader_pool_size: settings.log.reader_pool_size,
        busy_timeout_ms: settings.log.busy_timeout_ms,
        subscriber_buffer: settings.log.subscriber_buffer,
    }
}

fn release_config(settings: &Settings) -> ReleaseConfig {
    ReleaseConfig {
        program: settings.release.program.clone(),
        args: settings.release.args.clone(),
        timeout: settings.release.timeout_secs.map(Duration::from_secs),
    }
}

fn server_config(settings: &Settings) -> ServerConfig {
    ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        shutdown_timeout: Duration::from_secs(settings.shutdown_timeout_secs),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings_path = cli
        .config
        .clone()
        .unwrap_or_else(rollout_settings::settings_path);
    let mut settings = match rollout_settings::load_settings_from_path(&settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("rollout: failed to load settings from {}: {e}", settings_path.display());
            return ExitCode::FAILURE;
        }
    };
    cli.apply(&mut settings);

    if let Err(e) = rollout_telemetry::init_telemetry(&telemetry_config(&settings)) {
        eprintln!("rollout: {e}");
    }

    let services = match settings.services() {
        Ok(services) => services,
        Err(e) => {
            error!(error = %e, "invalid service mapping");
            return ExitCode::FAILURE;
        }
    };

    let log = match EventLog::open(&settings.log.path, log_config(&settings)) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            error!(path = %settings.log.path, error = %e, "failed to open event log");
            return ExitCode::FAILURE;
        }
    };
    crash::install_panic_hook(log.clone());

    match run(&settings, ServiceRegistry::new(services), log.clone()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            lifecycle::record_fatal(&log, &e);
            ExitCode::FAILURE
        }
    }
}

/// Boot, serve until SIGINT/SIGTERM, then stop in order.
async fn run(settings: &Settings, registry: ServiceRegistry, log: Arc<EventLog>) -> Result<()> {
    if registry.is_empty() {
        warn!("no services configured; every deploy request will be rejected");
    }
    for service in registry.iter() {
        info!(
            handle = %service.handle,
            image = %service.docker_image,
            rancher_service_id = %service.rancher_service_id,
            "registered service"
        );
    }

    lifecycle::boot(&log).context("failed to record boot")?;

    let executor = ReleaseExecutor::new(release_config(settings), RancherEnv::from_env());
    let controller =
        TriggerController::new(&registry, Arc::new(executor), Notifier::new(log.clone()));

    let _tap = rollout_server::tap::spawn_tap(&log).context("failed to start event tap")?;

    let config = server_config(settings);
    let coordinator = ShutdownCoordinator::new();
    let server = rollout_server::start(
        &config,
        AppState::new(log.clone(), controller.clone()),
        coordinator.token(),
    )
    .await
    .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;

    info!(
        addr = %server.addr,
        services = registry.count(),
        "rollout ready"
    );

    let signal = wait_for_signal()
        .await
        .context("failed to listen for shutdown signals")?;
    info!(signal, "shutting down");

    lifecycle::shutdown(
        &controller,
        &coordinator,
        server,
        &log,
        config.shutdown_timeout,
    )
    .await
    .context("failed to stop cleanly")?;
    Ok(())
}
