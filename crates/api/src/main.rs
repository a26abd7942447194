//! Nudge API server binary entrypoint.

use std::net::SocketAddr;

use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use nudge_common::config::AppConfig;

use nudge_api::routes::create_router;
use nudge_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("nudge_api=debug,nudge_notifier=debug,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Nudge API server...");

    let config = AppConfig::from_env()?;
    let addr: SocketAddr = config.api_bind_addr.parse()?;

    let state = AppState::new(config)?;
    if state.push.is_none() {
        tracing::warn!("OneSignal credentials missing, reminder RPCs will return config errors");
    }

    let app = create_router(state).layer(TraceLayer::new_for_http());

    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
        })
        .await?;

    Ok(())
}
