use clap::Parser;
use devproxy::config::Config;
use devproxy::proxy::ProxyServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Parser, Debug)]
#[command(name = "devproxy", version, about = "Development-server reverse proxy")]
struct Cli {
    /// Path to the configuration file
    #[arg(default_value = "devproxy.toml")]
    config: PathBuf,

    /// Override the bind address from the config file
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port from the config file
    #[arg(long)]
    port: Option<u16>,

    /// Validate the configuration, print a summary and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devproxy=debug".parse().expect("valid log directive")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config).map_err(|e| {
        error!(path = %cli.config.display(), error = %e, "Failed to load configuration");
        e
    })?;

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    info!(path = %cli.config.display(), "Configuration loaded");

    let bind_addr = config.server.bind_addr()?;
    let table = Arc::new(config.proxy_table()?);

    print_startup_banner(&config);

    if cli.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut proxy = ProxyServer::with_pool_config(
        bind_addr,
        Arc::clone(&table),
        shutdown_rx,
        config.server.pool_config(),
    );
    if let Some(timeout) = config.server.request_timeout() {
        proxy = proxy.with_request_timeout(timeout);
    }

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

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
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting dev proxy");
    info!(
        host = %config.server.host,
        port = config.server.port,
        request_timeout_secs = ?config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        plugins = ?config.plugins,
        base = %config.base,
        worker_format = ?config.worker.format,
        "Build settings (handled by the build tool)"
    );

    let mut prefixes: Vec<&String> = config.server.proxy.keys().collect();
    prefixes.sort();
    for prefix in prefixes {
        let rule = &config.server.proxy[prefix];
        info!(prefix = %prefix, upstream = rule.target(), "Proxy rule");
    }
}
