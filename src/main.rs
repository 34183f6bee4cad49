//! Tunnel Bridge - Entry Point

use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use tunnel_bridge::{
    CommandLauncher, Config, ControlClient, FirebaseRegistry, ReadinessPolicy, RegistryWatcher,
    StreamKeys, TunnelManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Tunnel Bridge v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: tunnel-bridge");
        println!();
        println!("Environment variables:");
        println!("  BRIDGE_DATABASE_URL            Realtime database URL (required)");
        println!("  BRIDGE_CREDENTIALS_PATH        Service account key (default: ./serviceAccountKey.json)");
        println!("  BRIDGE_TUNNEL_BIN              Tunnel executable (default: ngrok)");
        println!("  BRIDGE_CONTROL_URL             Tunnel control API (default: http://127.0.0.1:4040/api/tunnels)");
        println!("  BRIDGE_TARGET_PORT             Port of the local service (default: 80)");
        println!("  BRIDGE_READY_TIMEOUT_SECS      Wait for a new tunnel (default: 10)");
        println!("  BRIDGE_RESUBSCRIBE_DELAY_SECS  Pause before reconnecting (default: 5)");
        println!("  BRIDGE_STREAM_IDLE_SECS        Reconnect after this much silence (default: 90)");
        println!("  BRIDGE_LOG_JSON                Log as JSON when set to 1/true");
        println!("  RUST_LOG                       trace|debug|info|warn|error");
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let json_logs = std::env::var("BRIDGE_LOG_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    info!("Tunnel Bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let registry = Arc::new(FirebaseRegistry::connect(&config).await?);

    let readiness = ReadinessPolicy {
        timeout: config.ready_timeout,
        ..ReadinessPolicy::default()
    };
    let tunnel = Arc::new(TunnelManager::new(
        Arc::new(CommandLauncher::new(&config.tunnel_bin)),
        ControlClient::new(&config.control_url)?,
        config.target_port,
        readiness,
    ));

    info!("Starting service");
    let watcher = RegistryWatcher::new(registry, tunnel, StreamKeys::default());
    if let Err(e) = watcher.watch(shutdown_signal()).await {
        error!("Subscription failed: {}", e);
        return Err(e.into());
    }

    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
