//! Entry point: load config, wire the presence store, and run the server.

use presence_hub::config::Config;
use presence_hub::services::PresenceStore;
use presence_hub::{create_app, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let presence = PresenceStore::new(config.presence);
    presence.start().await;

    let state = AppState::new(presence.clone());
    let forwarder = state.rooms().forward_evictions(presence.clone());
    let app = create_app(state);

    tracing::info!(
        addr = %config.server_addr,
        heartbeat_secs = config.presence.heartbeat_interval.as_secs(),
        ttl_secs = config.presence.ttl.as_secs(),
        "listening"
    );
    let listener = tokio::net::TcpListener::bind(config.server_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    forwarder.abort();
    presence.stop().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
