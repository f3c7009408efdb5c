mod api;
mod config;
mod discovery;
mod error;
mod mdns;
mod net;
mod registry;
mod store;
mod store_manager;

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::discovery::options::DiscoveryOptions;
use crate::discovery::orchestrator::ScanOrchestrator;
use crate::discovery::scheduler::ProbeSet;
use crate::registry::Registry;
use crate::store::db::RegistryDb;
use crate::store_manager::StoreHandle;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ua_discoveryd=info"))
        )
        .init();

    tracing::info!("Starting ua-discoveryd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/ua-discovery/discoveryd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // Open SQLite database
    let db = RegistryDb::open(&config.registry.db_path)?;
    tracing::info!("Opened database at {:?}", config.registry.db_path);

    let initial_hash = store_manager::registry_hash(&db)
        .context("Failed to compute initial registry hash")?;
    tracing::info!("Initial registry hash: {}", initial_hash);

    let (hash_tx, hash_rx) = watch::channel(initial_hash);
    let store = StoreHandle::spawn(db, hash_tx);
    let registry = Arc::new(Registry::new(Arc::new(store.clone()), &config.registry));

    // Discovery starts with the configured mode; the API may change it later
    let options = DiscoveryOptions::new(config.discovery.mode, &config.discovery.config);
    let (orchestrator, discovery) = ScanOrchestrator::new(
        ProbeSet::system(),
        registry.clone(),
        config.bridge.clone(),
        options,
    );

    let cancel = CancellationToken::new();

    let discovery_cancel = cancel.clone();
    let discovery_handle = tokio::spawn(async move {
        if let Err(e) = orchestrator.run(discovery_cancel).await {
            tracing::error!("Discovery error: {}", e);
        }
    });

    let maintenance_cancel = cancel.clone();
    let maintenance_registry = registry.clone();
    let maintenance_config = config.registry.clone();
    let maintenance_handle = tokio::spawn(async move {
        if let Err(e) = store_manager::run(maintenance_registry, maintenance_config, maintenance_cancel).await {
            tracing::error!("Registry maintenance error: {}", e);
        }
    });

    // Build API router
    let app_state = api::routes::AppState {
        registry: registry.clone(),
        discovery: discovery.clone(),
        hash_rx,
        config: Arc::new(config.registry.clone()),
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;
    let api_port = listener
        .local_addr()
        .context("Failed to read listen address")?
        .port();

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Multicast: announce the API and register servers that announce themselves
    let mut mdns = None;
    if config.mdns.enabled {
        let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;
        if let Some(interface) = &config.mdns.interface {
            daemon
                .disable_interface(mdns_sd::IfKind::All)
                .context("Failed to disable default interfaces")?;
            daemon
                .enable_interface(interface.as_str())
                .with_context(|| format!("Failed to enable interface {}", interface))?;
        }

        let service_info = mdns::advertise::register_bridge(&daemon, &config.bridge, api_port)?;

        let browser_cancel = cancel.clone();
        let browser_daemon = daemon.clone();
        let browser_discovery = discovery.clone();
        let browser_handle = tokio::spawn(async move {
            if let Err(e) = mdns::browser::run_browser(browser_daemon, browser_discovery, browser_cancel).await {
                tracing::error!("mDNS browser error: {}", e);
            }
        });
        mdns = Some((daemon, service_info, browser_handle));
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    let _ = tokio::join!(discovery_handle, maintenance_handle, server_handle);

    if let Some((daemon, service_info, browser_handle)) = mdns {
        let _ = browser_handle.await;
        if let Err(e) = mdns::advertise::unregister_bridge(&daemon, &service_info) {
            tracing::error!("Failed to unregister mDNS service: {}", e);
        }
        if let Err(e) = daemon.shutdown() {
            tracing::error!("Failed to shutdown mDNS daemon: {}", e);
        }
    }

    // Shutdown store thread
    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
