//! ---
//! cc_section: "01-core-functionality"
//! cc_subsection: "binary"
//! cc_type: "source"
//! cc_scope: "code"
//! cc_description: "Binary entrypoint for the ChaosCraft control-plane daemon."
//! cc_version: "v0.1.0"
//! cc_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chaoscraft_api::{spawn_api_server, ApiState};
use chaoscraft_common::config::{AppConfig, ExecutorConfig, ExecutorKind, StoreConfig};
use chaoscraft_common::logging::init_tracing;
use chaoscraft_common::version::VersionInfo;
use chaoscraft_core::{
    DryRunExecutor, EngineSettings, HttpExecutor, InjectionExecutor, LifecycleEngine,
    LifecycleMetrics, MaintenanceSweeper, RetryPolicy,
};
use chaoscraft_metrics::{new_registry, DaemonMetrics};
use chaoscraft_store::{ExperimentStore, MemoryStore, SqliteStore, StoreLocation};
use clap::{ArgAction, Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    version = concat!("chaoscraftd ", env!("CARGO_PKG_VERSION")),
    about = "ChaosCraft control-plane daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "ADDR", help = "Override the API listen address")]
    listen: Option<SocketAddr>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print extended version information and exit"
    )]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the control plane")]
    Run,
    #[command(about = "Apply pending store schema migrations and exit")]
    Migrate,
    #[command(about = "Validate configuration and print the effective settings")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let version = VersionInfo::current();
    if cli.version {
        println!("{}", version.extended());
        return Ok(());
    }

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/chaoscraft.toml"));
    candidates.push(PathBuf::from("configs/example.dev.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();
    let mut config = loaded.config;
    if let Some(listen) = cli.listen {
        config.api.listen = listen;
    }

    init_tracing("chaoscraftd", &config.logging)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), environment = ?config.environment, "configuration loaded"),
        None => info!(environment = ?config.environment, "no configuration file found; using defaults"),
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(config, version, load_duration.as_secs_f64()).await?,
        Commands::Migrate => {
            let location = StoreLocation::parse(&config.store.url)?;
            if location == StoreLocation::Memory {
                println!("store {} needs no migrations", config.store.url);
                return Ok(());
            }
            let store = SqliteStore::open_location(&location, config.store.busy_timeout)
                .with_context(|| format!("failed to open store {}", config.store.url))?;
            let schema = store.migrate().await?;
            info!(schema_version = schema, "store migrated");
            println!("store {} at schema version {}", config.store.url, schema);
        }
        Commands::CheckConfig => {
            println!(
                "configuration OK\n  source: {}\n  environment: {:?}\n  listen: {}\n  store: {}\n  executor: {:?}\n  metrics: {}",
                loaded
                    .source
                    .as_ref()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| "<defaults>".to_owned()),
                config.environment,
                config.api.listen,
                config.store.url,
                config.executor.kind,
                config.metrics.enabled
            );
        }
    }

    Ok(())
}

async fn open_store(settings: &StoreConfig) -> Result<Arc<dyn ExperimentStore>> {
    let location = StoreLocation::parse(&settings.url)?;
    if location == StoreLocation::Memory {
        warn!("memory store selected; experiments will not survive a restart");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = SqliteStore::open_location(&location, settings.busy_timeout)
        .with_context(|| format!("failed to open store {}", settings.url))?;
    if settings.auto_migrate || location == StoreLocation::SqliteMemory {
        let schema = store.migrate().await?;
        info!(schema_version = schema, "store schema up to date");
    } else {
        store
            .ensure_schema_current()
            .await
            .context("store schema check failed")?;
    }
    Ok(Arc::new(store))
}

fn build_executor(settings: &ExecutorConfig) -> Result<Arc<dyn InjectionExecutor>> {
    match settings.kind {
        ExecutorKind::DryRun => {
            warn!("dry-run executor selected; faults are logged, not injected");
            Ok(Arc::new(DryRunExecutor))
        }
        ExecutorKind::Http => {
            let endpoint = settings
                .endpoint
                .clone()
                .context("http executor requires executor.endpoint")?;
            info!(endpoint = %endpoint, "http injection executor configured");
            Ok(Arc::new(HttpExecutor::new(
                endpoint,
                settings.token.clone(),
                settings.effect_timeout,
            )?))
        }
    }
}

async fn run_daemon(config: AppConfig, version: VersionInfo, config_load_seconds: f64) -> Result<()> {
    let store = open_store(&config.store).await?;
    let executor = build_executor(&config.executor)?;

    let registry = if config.metrics.enabled {
        let registry = new_registry();
        let daemon_metrics = DaemonMetrics::new(registry.clone())?;
        daemon_metrics.observe_config_load(config_load_seconds);
        daemon_metrics.inc_start();
        daemon_metrics.set_build_info(&version.semver, &version.profile, store.backend());
        Some(registry)
    } else {
        info!("metrics disabled by configuration");
        None
    };

    let lifecycle = &config.lifecycle;
    let settings = EngineSettings {
        retry: RetryPolicy::new(
            lifecycle.retry_attempts,
            lifecycle.retry_base_delay,
            lifecycle.retry_jitter,
        ),
        effect_timeout: config.executor.effect_timeout,
    };
    let mut engine = LifecycleEngine::new(store, executor, settings);
    if let Some(registry) = &registry {
        engine = engine.with_metrics(LifecycleMetrics::new(registry.clone())?);
    }
    let engine = Arc::new(engine);

    let (sweeper_tx, sweeper_rx) = watch::channel(false);
    let sweeper = MaintenanceSweeper::new(engine.clone(), lifecycle.sweep_interval)
        .with_stale_recovery(lifecycle.recover_stale_after)
        .spawn(sweeper_rx);

    let mut state = ApiState::new(engine.clone(), version.clone());
    if let Some(registry) = registry {
        state = state.with_metrics(registry)?;
    }
    let api_server = spawn_api_server(
        Arc::new(state),
        config.api.listen,
        config.api.request_timeout,
    )?;

    info!(
        address = %api_server.addr(),
        store = engine.store_backend(),
        executor = engine.executor_name(),
        version = %version.cli_string(),
        "daemon running; waiting for termination signal"
    );
    shutdown_signal().await?;
    info!("termination signal received; shutting down");

    api_server.shutdown().await?;
    let _ = sweeper_tx.send(true);
    if let Err(err) = sweeper.await {
        warn!(error = %err, "maintenance sweeper exited abnormally");
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => result.context("failed to listen for ctrl-c")?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    Ok(())
}
