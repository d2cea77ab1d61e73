use anyhow::{Context, Result};
use axum::http::HeaderValue;
use postpilot::api::{create_connections_router, ConnectionsAppState};
use postpilot::config::{load_config, StateBackend};
use postpilot::connections::ConnectionService;
use postpilot::credentials::{CredentialStore, TokenCipher};
use postpilot::oauth::{
    run_state_cleanup, CorrelationMarker, CorrelationStore, MemoryCorrelationStore,
    ProviderRegistry, SqliteCorrelationStore, StateManager, TokenExchanger,
};
use postpilot::refresh::{RefreshScheduler, TokenRefresher};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "postpilot=info".into()),
        )
        .init();

    info!("PostPilot connection service starting...");

    let config_path =
        std::env::var("POSTPILOT_CONFIG").unwrap_or_else(|_| "postpilot.toml".to_string());
    let config = load_config(&config_path)?;

    let cipher = Arc::new(
        TokenCipher::from_base64(config.require_encryption_key()?.expose())
            .context("Invalid POSTPILOT_ENCRYPTION_KEY")?,
    );

    info!(
        config = %config_path,
        db_path = %config.storage.db_path,
        bind_addr = %config.server.bind_addr,
        auth_enabled = config.server.auth_enabled,
        "Configuration loaded"
    );

    let registry = Arc::new(ProviderRegistry::from_config(&config));
    let registered = registry.registered();
    if registered.is_empty() {
        warn!("No OAuth providers configured, connections are disabled");
    } else {
        info!(platforms = ?registered, "OAuth providers registered");
    }

    let credential_store = Arc::new(
        CredentialStore::with_cipher(&config.storage.db_path, Arc::clone(&cipher))
            .context("Failed to initialize credential store")?,
    );
    info!("Credential store initialized");

    let correlation_store: Arc<dyn CorrelationStore> = match config.state.backend {
        StateBackend::Memory => Arc::new(MemoryCorrelationStore::new()),
        StateBackend::Sqlite => Arc::new(
            SqliteCorrelationStore::open(&config.storage.db_path)
                .context("Failed to initialize OAuth state store")?,
        ),
    };
    let states = StateManager::new(correlation_store, config.state.lifetime_seconds);
    tokio::spawn(run_state_cleanup(
        states.clone(),
        config.state.cleanup_interval_seconds,
    ));

    let exchanger = Arc::new(
        TokenExchanger::new(
            Arc::clone(&registry),
            Duration::from_secs(config.exchange.request_timeout_seconds),
        )
        .context("Failed to build token exchange client")?,
    );

    let scheduler = Arc::new(RefreshScheduler::new(
        Arc::clone(&credential_store),
        Arc::clone(&exchanger) as Arc<dyn TokenRefresher>,
        config.refresh.buffer_seconds,
    ));
    let scheduler_handle = if config.refresh.enabled {
        Some(Arc::clone(&scheduler).start(config.refresh.interval_seconds))
    } else {
        warn!("Token refresh scheduler disabled");
        None
    };

    let service = Arc::new(ConnectionService::new(
        states,
        CorrelationMarker::new(cipher),
        exchanger,
        credential_store,
        scheduler,
    ));

    let router = create_connections_router(ConnectionsAppState {
        service,
        auth_enabled: config.server.auth_enabled,
        connections_url: config.server.connections_url.clone(),
    })
    .layer(cors_layer(&config.server.cors_origins)?);

    let listener = tokio::net::TcpListener::bind(config.server.bind_addr.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "Connections API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "Connections API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    if let Some(handle) = scheduler_handle {
        handle.abort();
    }
    info!("PostPilot connection service stopped");

    Ok(())
}

/// CORS for the dashboard origin(s); permissive when none are configured
fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    if origins.is_empty() {
        return Ok(CorsLayer::permissive());
    }

    let origins = origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .with_context(|| format!("Invalid CORS origin '{}'", origin))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any))
}
