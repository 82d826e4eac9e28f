//! HTTP API handlers for bookvibe-ir

pub mod health;
pub mod resolve;
pub mod sse;

pub use health::health_routes;
pub use resolve::resolve_routes;
pub use sse::event_stream;
