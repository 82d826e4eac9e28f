//! # BookVibe Common Library
//!
//! Shared code for the BookVibe services including:
//! - Layered configuration loading
//! - Event types (BookVibeEvent enum) and EventBus
//! - Location record types shared between extraction output and resolution
//! - Common error types

pub mod config;
pub mod error;
pub mod events;
pub mod records;

pub use error::{Error, Result};
