//! OpsTower - Ops Manager fleet control tower
//!
//! Main entry point for the aggregation service.

use std::sync::Arc;
use std::time::Duration;

use opstower::{
    fanout::FanoutAggregator,
    orchestrator::CacheFirstOrchestrator,
    registry::ServerRegistry,
    remote_client::RemoteClient,
    snapshot_store::SnapshotStore,
    state::{AppConfig, AppState},
    web_api,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opstower=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting OpsTower v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        servers_file = %config.servers_file.display(),
        cache_dir = %config.cache_dir.display(),
        freshness_secs = config.freshness_secs,
        fanout_timeout_secs = config.fanout_timeout_secs,
        "Configuration loaded"
    );

    // Registry is the only fatal load: without it there is nothing to
    // fan out to.
    let registry = Arc::new(ServerRegistry::load(&config.servers_file).await?);

    let store = Arc::new(SnapshotStore::new(config.cache_dir.clone()).await?);
    tracing::info!(cache_dir = %config.cache_dir.display(), "SnapshotStore initialized");

    let client = Arc::new(RemoteClient::new());

    let fanout = FanoutAggregator::new(client.clone(), store.clone())
        .with_fanout_timeout(Duration::from_secs(config.fanout_timeout_secs));

    let orchestrator = Arc::new(
        CacheFirstOrchestrator::new(
            registry.clone(),
            store.clone(),
            client.clone(),
            fanout,
        )
        .with_freshness(Duration::from_secs(config.freshness_secs)),
    );
    tracing::info!(servers = registry.len(), "CacheFirstOrchestrator initialized");

    // Create application state
    let state = AppState {
        config: config.clone(),
        registry,
        store,
        client,
        orchestrator,
    };

    let app = web_api::create_router(state.clone())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
