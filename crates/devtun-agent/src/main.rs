use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use devtun_agent::{
    AdbClient, AdbDiscovery, AdbIdentityResolver, AgentConfig, ControlApiClient, DeviceKey,
    DeviceTunnelManager, TunnelEstablisher,
};

/// Device tunnel agent - keeps devices reachable through cloud access points
#[derive(Parser, Debug)]
#[command(name = "devtun-agent")]
#[command(about = "Reverse tunnel agent for ADB-attached and desktop devices")]
struct Args {
    /// Path to configuration file (default: ~/.config/devtun/agent.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Desktop device key to connect at startup (repeatable)
    #[arg(long = "device", value_name = "KEY")]
    devices: Vec<String>,

    /// Do not track ADB-attached devices
    #[arg(long)]
    no_adb: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("devtun_agent=info".parse()?)
                .add_directive("devtun_common=info".parse()?),
        )
        .init();
    install_panic_logging();

    let args = Args::parse();
    let config_path = args
        .config
        .clone()
        .or_else(|| AgentConfig::default_path().map(|p| p.display().to_string()))
        .unwrap_or_else(|| "agent.toml".to_string());
    tracing::info!("Starting device tunnel agent with config: {}", config_path);

    let mut config = AgentConfig::load_and_resolve(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    config
        .devices
        .extend(args.devices.into_iter().map(DeviceKey::from));
    if args.no_adb {
        config.enable_adb = false;
    }

    tracing::info!("Control API: {}", config.control_api_url);
    tracing::info!("Client id: {}", config.client_id);

    let tls_config = match &config.ca_cert {
        Some(path) => {
            tracing::info!("Access point TLS: trusting CA bundle {}", path.display());
            devtun_common::load_client_config(path)
                .context("Failed to load access point CA bundle")?
        }
        None => devtun_common::load_webpki_client_config(),
    };

    let api = Arc::new(
        ControlApiClient::new(
            &config.control_api_url,
            &config.api_token,
            &config.client_id,
            config.handshake_timeout,
        )
        .context("Failed to create control API client")?,
    );
    let adb = AdbClient::new(config.adb_addr.clone());
    let resolver = Arc::new(AdbIdentityResolver::new(adb.clone(), api.clone()));
    let establisher = TunnelEstablisher::new(
        Arc::new(tls_config),
        config.client_id.clone(),
        config.handshake_timeout,
    );
    let manager = DeviceTunnelManager::new(resolver, api, establisher);

    for key in config.devices.iter().cloned() {
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.connect_by_key(&key).await {
                tracing::error!("Failed to connect desktop device {}: {}", key, e);
            }
        });
    }

    if !config.enable_adb {
        tracing::info!("ADB discovery disabled");
    }

    tokio::select! {
        _ = AdbDiscovery::new(adb).run(manager.clone(), config.discovery_retry), if config.enable_adb => {}
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, closing tunnels...");
        }
    }

    manager.shutdown().await;
    tracing::info!("Agent shutdown complete");
    Ok(())
}

/// Route panics through tracing with a backtrace
fn install_panic_logging() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!("{}\n{}", info, backtrace);
    }));
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}
