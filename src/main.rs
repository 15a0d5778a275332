use anyhow::Context;
use notebook_hub::api::ApiServer;
use notebook_hub::config::Config;
use notebook_hub::pool::PoolConfig;
use notebook_hub::proxy::ProxyServer;
use notebook_hub::registry::Registry;
use notebook_hub::router::{BackendDirectory, NotebookDirectory, Router};
use notebook_hub::runner::Runner;
use notebook_hub::websocket::WebSocketProxy;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("notebook_hub=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("notebook-hub.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = Arc::new(Runner::new(
        config.runner.clone(),
        config.notebooks.port_range,
        shutdown_rx.clone(),
    ));

    if let Some(parent) = Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory '{}'", parent.display()))?;
    }

    // Opening replays every stored notebook to the runner
    let registry = Arc::new(
        Registry::open(&config.database.path, vec![runner.subscriber()])
            .with_context(|| format!("failed to open registry at '{}'", config.database.path))?,
    );
    info!(notebooks = registry.list().len(), "Registry loaded");

    let notebooks: Arc<dyn NotebookDirectory> = registry.clone();
    let backends: Arc<dyn BackendDirectory> = runner.clone();
    let router = Router::new(notebooks, backends);

    let websocket = WebSocketProxy::new(
        router.clone(),
        config.websocket.clone(),
        config.server.connect_timeout(),
    );

    let proxy_addr = listen_addr(&config.server.bind, config.server.proxy_port)?;
    let proxy_server = ProxyServer::with_pool_config(
        proxy_addr,
        router,
        websocket,
        shutdown_rx.clone(),
        PoolConfig::from(&config.server),
    );

    let api_addr = listen_addr(&config.server.bind, config.server.api_port)?;
    let api_server = Arc::new(ApiServer::new(
        api_addr,
        Arc::clone(&registry),
        Arc::clone(&runner),
        shutdown_rx.clone(),
    ));

    let mut editor = if config.editor.enabled {
        match spawn_editor(&config) {
            Ok(child) => Some(child),
            Err(e) => {
                warn!(error = %e, "Failed to start notebook editor, continuing without it");
                None
            }
        }
    } else {
        None
    };

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping all notebooks...");
    runner.shutdown().await;

    if let Some(child) = editor.as_mut() {
        if let Err(e) = child.kill().await {
            warn!(error = %e, "Failed to stop notebook editor");
        }
    }

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = api_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}

fn listen_addr(bind: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", bind, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", bind, port))
}

/// Shared editor serving the whole notebooks directory
fn spawn_editor(config: &Config) -> anyhow::Result<Child> {
    let port = config.editor.port.to_string();
    let child = Command::new(&config.runner.program)
        .args([
            "edit",
            "--headless",
            "-p",
            port.as_str(),
            "--skip-update-check",
            "--watch",
            "--allow-origins",
            "*",
            "--no-token",
        ])
        .current_dir(&config.notebooks.path)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn '{}' editor", config.runner.program))?;

    info!(port = config.editor.port, pid = ?child.id(), dir = %config.notebooks.path, "Notebook editor started");
    Ok(child)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting notebook hub");
    info!(
        bind = %config.server.bind,
        api_port = config.server.api_port,
        proxy_port = config.server.proxy_port,
        websocket_path = %config.websocket.path,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        "Connection pool settings"
    );
    info!(
        notebooks = %config.notebooks.path,
        port_start = config.notebooks.port_range.start,
        port_end = config.notebooks.port_range.end,
        program = %config.runner.program,
        database = %config.database.path,
        editor = config.editor.enabled,
        "Notebook settings"
    );
}
