//! # Logging Module
//!
//! This module provides centralized logging functionality for the Turnstile
//! admission gateway: tracing initialization plus persistent error records
//! with automatic cleanup.
//!
//! ## Features
//!
//! - **Error Logging**: Persistent error storage in the database
//! - **Automatic Cleanup**: Background cleanup of old error records
//! - **Non-blocking Operations**: Async error logging off the request path

pub mod errors;

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber. `RUST_LOG` wins over the passed
/// default filter.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
