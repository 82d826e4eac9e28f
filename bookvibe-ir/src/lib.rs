//! bookvibe-ir library interface
//!
//! Exposes the resolver components and HTTP surface for integration testing.

pub mod api;
pub mod error;
pub mod models;
pub mod services;

pub use crate::error::{ApiError, ApiResult};

use axum::Router;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use bookvibe_common::config::BookVibeConfig;
use bookvibe_common::events::EventBus;

use crate::models::ResolutionBatch;
use crate::services::resolution_orchestrator::ResolutionOrchestrator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Merged, immutable configuration
    pub config: Arc<BookVibeConfig>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Batch resolver
    pub orchestrator: Arc<ResolutionOrchestrator>,
    /// Live and completed resolution batches by id
    pub batches: Arc<RwLock<HashMap<Uuid, Arc<ResolutionBatch>>>>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: BookVibeConfig, event_bus: EventBus) -> Self {
        let orchestrator = Arc::new(ResolutionOrchestrator::new(&config, event_bus.clone()));
        Self {
            config: Arc::new(config),
            event_bus,
            orchestrator,
            batches: Arc::new(RwLock::new(HashMap::new())),
            startup_time: Utc::now(),
        }
    }

    /// State with an externally built orchestrator (integration tests)
    pub fn with_orchestrator(
        config: BookVibeConfig,
        event_bus: EventBus,
        orchestrator: Arc<ResolutionOrchestrator>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            event_bus,
            orchestrator,
            batches: Arc::new(RwLock::new(HashMap::new())),
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
///
/// CORS is permissive: the browser client is served from a different origin
/// during development.
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    Router::new()
        .merge(api::resolve_routes())
        .route("/events", get(api::event_stream))
        .merge(api::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
