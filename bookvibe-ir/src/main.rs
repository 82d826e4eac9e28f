//! bookvibe-ir - BookVibe Image Resolver service
//!
//! Resolves location records extracted from books into postcard images:
//! stock photo search for real places, a generative cascade (paid backend,
//! then free URL-templated services, then a deterministic placeholder) for
//! fictional ones. Progress streams to clients over SSE.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use bookvibe_common::config::BookVibeConfig;
use bookvibe_common::events::EventBus;
use bookvibe_ir::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting bookvibe-ir (Image Resolver) service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Layered config: defaults, environment, persisted settings file
    let config = BookVibeConfig::load();
    let bind = config.server.bind.clone();

    // Event bus for SSE broadcasting
    let event_bus = EventBus::new(100);
    info!("Event bus initialized (capacity {})", event_bus.capacity());

    let state = AppState::new(config, event_bus);
    let app = bookvibe_ir::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("Listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    axum::serve(listener, app).await?;

    Ok(())
}
