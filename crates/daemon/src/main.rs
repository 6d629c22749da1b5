//! tenantmux daemon
//!
//! Supervises one application process per tenant and keeps the reverse
//! proxy configuration in step with the running set.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod installer;
mod launcher;
mod probe;
mod proxy;
mod reconciler;
mod state;
mod supervisor;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "tenantmuxd")]
#[command(about = "tenantmux daemon - per-tenant process supervisor and proxy config manager")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TENANTMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Store directory (overrides the config file)
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// API listen address (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!("tenantmux daemon v{}", tenantmux_common::VERSION);

    let config_path = cli
        .config
        .unwrap_or_else(|| tenantmux_common::default_store_path().join("config.toml"));
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.api_listen = listen;
    }
    config.validate()?;

    if cli.init_config {
        config.save(&config_path)?;
        info!("Wrote configuration to {}", config_path.display());
        return Ok(());
    }
    info!("Using configuration {}", config_path.display());

    tokio::fs::create_dir_all(&config.store_path).await?;
    tokio::fs::create_dir_all(&config.data_root).await?;

    let store = state::InstanceStore::open(&config)?;
    let supervisor = supervisor::Supervisor::new(
        store.clone(),
        Arc::new(launcher::OsLauncher::new()),
        config.app.clone(),
        config.supervisor.clone(),
    );
    supervisor.adopt_startup()?;

    let controller: Arc<dyn proxy::ProxyController> = Arc::new(proxy::NginxController::new(
        config.proxy.nginx_binary.clone(),
        config.proxy.reload_args.clone(),
        config.proxy.command_timeout(),
    ));
    let proxy = Arc::new(proxy::ProxyManager::new(
        store.clone(),
        &config.proxy,
        &config.app.original_title,
        controller.clone(),
    ));

    let loops = CancellationToken::new();
    let reconciler = reconciler::Reconciler::new(supervisor.clone());
    let reconciler_handle = tokio::spawn({
        let cancel = loops.clone();
        async move { reconciler.run(cancel).await }
    });

    let sync_handle = tokio::spawn(proxy.clone().run_sync(
        supervisor.route_changes(),
        config.supervisor.reconcile_interval(),
        loops.clone(),
    ));

    let state = api::AppState {
        installer: Arc::new(installer::Installer::new(store.clone(), config.app.clone())),
        diagnostics: Arc::new(probe::Diagnostics::new(
            store.clone(),
            supervisor.clone(),
            config.app.clone(),
            controller,
        )),
        drift: Arc::new(reconciler::DriftDetector::new(supervisor.clone())),
        store,
        supervisor: supervisor.clone(),
        proxy,
        config: Arc::new(config.clone()),
    };
    let listen = config.api_listen.clone();
    let mut api_handle = tokio::spawn(async move { api::serve(state, &listen).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut api_handle => {
            match result {
                Ok(Err(e)) => error!("API server error: {}", e),
                Err(e) => error!("API server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    // Nothing may start an instance once the supervisor begins stopping them
    api_handle.abort();
    loops.cancel();
    if let Err(e) = reconciler_handle.await {
        error!("Reconciler error: {}", e);
    }
    if let Err(e) = sync_handle.await {
        error!("Proxy sync error: {}", e);
    }
    supervisor.shutdown().await;
    info!("Daemon shutdown complete");
    Ok(())
}
