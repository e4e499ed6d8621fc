use nbgate::auth::GatewayAuthFlow;
use nbgate::config::{content_gateway_port, Config, RuntimeSwitches, CONTENT_GATEWAY_ENV};
use nbgate::info::{PKG_NAME, VERSION};
use nbgate::server::{AppContext, RouterServer, SocketMode};
use nbgate::spawner::CommandSpawner;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nbgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    let switches = RuntimeSwitches::from_env();

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config, switches);

    // Shutdown and restart channels
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (restart_tx, mut restart_rx) = watch::channel(false);

    // Content gateway port for the proxied /_nocachecontent/ mode
    let nocache_gateway_port = std::env::var(CONTENT_GATEWAY_ENV)
        .ok()
        .filter(|url| !url.is_empty())
        .and_then(|url| {
            let port = content_gateway_port(&url);
            if port.is_none() {
                warn!(url, "Content gateway URL has no usable port; serving no-cache content locally");
            }
            port
        });

    let spawner = Arc::new(CommandSpawner::new(
        &config.backend.command,
        config.backend.base_port,
        Duration::from_millis(config.backend.poll_interval_ms),
    ));
    let auth = Arc::new(GatewayAuthFlow::new(&config.auth.gateway_url));

    let ctx = AppContext::new(
        &config,
        switches,
        nocache_gateway_port,
        spawner,
        auth,
        restart_tx,
    );

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = RouterServer::new(bind_addr, ctx, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Router server error");
        }
    });

    // Wait for shutdown (Ctrl+C or SIGTERM) or a /_restart request
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            _ = restart_rx.changed() => {
                if *restart_rx.borrow() {
                    // The 200 already went out; give the socket a moment to
                    // flush, then terminate so the supervisor restarts us.
                    info!("Restart requested; exiting");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    std::process::exit(0);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
            }
            _ = restart_rx.changed() => {
                if *restart_rx.borrow() {
                    info!("Restart requested; exiting");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    std::process::exit(0);
                }
            }
        }
    }

    // Signal shutdown and wait for the listener to stop (with timeout)
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config, switches: RuntimeSwitches) {
    info!(name = PKG_NAME, version = VERSION, "Starting notebook router");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        marker_dir = %config.eula.marker_dir,
        page = %config.eula.page_path,
        "EULA gate"
    );
    info!(
        command = %config.backend.command,
        base_port = config.backend.base_port,
        "Backend spawn settings"
    );
    let socket_mode = if switches.proxy_web_sockets {
        SocketMode::Wrapped
    } else {
        SocketMode::Direct
    };
    info!(
        proxy_nocache_content = switches.proxy_nocache_content,
        socket_mode = ?socket_mode,
        "Runtime switches"
    );
}
