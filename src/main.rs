use devgate::config::Config;
use devgate::coordinator::{Coordinator, SystemClock};
use devgate::notifier::notify_dirty;
use devgate::proxy::ProxyServer;
use devgate::runner::CommandRunner;
use devgate::waiter::TcpDialer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "devgate.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("devgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // devgate [config.toml] | devgate notify [config.toml]
    let mut args = std::env::args().skip(1);
    let first = args.next();
    let (notify, config_arg) = match first.as_deref() {
        Some("notify") => (true, args.next()),
        _ => (false, first),
    };
    let config_path = config_arg
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    if notify {
        notify_dirty(
            &TcpDialer,
            &config.server.bind,
            &config.server.notify_route,
            config.backend.connect_timeout(),
        )
        .await?;
        return Ok(());
    }

    print_startup_banner(&config);

    let bind_addr = config.server.bind_addr()?;

    let runner = Arc::new(CommandRunner::new(
        &config.backend.build_command,
        &config.backend.binary,
        config.backend.shutdown_grace_period(),
    ));

    let coordinator = Arc::new(Coordinator::new(
        config.backend.address.clone(),
        config.backend.connect_timeout(),
        runner,
        Arc::new(TcpDialer),
        Arc::new(SystemClock),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxy = ProxyServer::with_pool_config(
        bind_addr,
        config.server.notify_route.clone(),
        Arc::clone(&coordinator),
        shutdown_rx,
        config.server.pool_config(),
    );

    let pool_stats = proxy.pool().stats();

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_shutdown_signal().await?;

    let _ = shutdown_tx.send(true);

    coordinator.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    info!(
        forwarded = pool_stats.get_forwarded(),
        failed = pool_stats.get_failed(),
        "Shutdown complete"
    );
    Ok(())
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
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

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting development proxy"
    );
    info!(
        bind = %config.server.bind,
        notify_route = %config.server.notify_route,
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Server configuration"
    );
    info!(
        address = %config.backend.address,
        binary = %config.backend.binary,
        build_command = %config.backend.build_command,
        connect_timeout_secs = config.backend.connect_timeout_secs,
        shutdown_grace_period_secs = config.backend.shutdown_grace_period_secs,
        "Backend configuration"
    );
}
