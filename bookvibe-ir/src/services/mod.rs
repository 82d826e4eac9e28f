//! Image resolution services

pub mod generative;
pub mod placeholder;
pub mod resolution_orchestrator;
pub mod stock_search;
