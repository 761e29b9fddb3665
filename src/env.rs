//! Environment variable validation and configuration module for Turnstile
//!
//! This module provides centralized validation and configuration management
//! for all environment variables used by the Turnstile admission gateway.
//!
//! # Supported Environment Variables
//!
//! ## Database Configuration
//! - `TURNSTILE_DB_URL`: Database connection URL (default: "sqlite://turnstile.db")
//!
//! ## Server Configuration
//! - `TURNSTILE_HOST`: Server bind address (default: "0.0.0.0")
//! - `TURNSTILE_PORT`: Server port (default: "3000")
//! - `TURNSTILE_UPSTREAM_URL`: Base URL admitted requests are forwarded to
//!   (required by `start`, optional for every other command)
//!
//! ## Admission Policies
//! - `TURNSTILE_ANON_LIMIT` / `TURNSTILE_ANON_WINDOW_MS`: per-IP fixed window
//!   (default: 30 requests per 60000 ms)
//! - `TURNSTILE_AUTH_LIMIT` / `TURNSTILE_AUTH_WINDOW_MS`: per-user fixed window
//!   (default: 100 requests per 3600000 ms)
//! - `TURNSTILE_ANON_STORE`: bucket backend for the anonymous policy,
//!   "sqlite" or "memory" (default: "sqlite")
//! - `TURNSTILE_STORE_FAILURE`: "closed" rejects with 503 when the bucket
//!   store is unavailable, "open" admits (default: "closed")
//!
//! ## Guard Configuration
//! - `TURNSTILE_CORS_ALLOWED_ORIGINS`: comma-separated origin allow-list
//! - `TURNSTILE_JWT_SECRET`: HMAC secret; when set, a valid bearer token's
//!   `sub` claim becomes the caller identity
//!
//! ## Logging and Housekeeping
//! - `RUST_LOG` / `TURNSTILE_LOG_LEVEL`: log filter
//! - `TURNSTILE_ERROR_LOG_RETENTION_DAYS`: days to keep error logs (default: "7")
//! - `TURNSTILE_SWEEP_INTERVAL_SECS`: expired-bucket sweep cadence (default: "300")

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tracing::{info, warn};

/// Environment validation errors
#[derive(Debug, Clone)]
pub struct EnvValidationError {
    pub variable: String,
    pub message: String,
    pub severity: ErrorSeverity,
}

/// Severity level for environment validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    /// Critical errors that prevent application startup
    Critical,
    /// Warnings about missing optional variables or suboptimal configurations
    Warning,
    /// Informational messages about default values being used
    Info,
}

/// Bucket store backend for the anonymous (per-IP) policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnonStoreBackend {
    /// Durable, shared between instances pointing at the same database file
    Sqlite,
    /// Volatile, per-process
    Memory,
}

/// What the guard does when the bucket store cannot answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFailurePolicy {
    /// Reject with 503 (default): an admission layer that cannot consult its
    /// ledger stops admitting
    Closed,
    /// Admit and log a warning
    Open,
}

/// Validated application configuration derived from environment variables
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Database
    pub database_url: String,

    // Server
    pub host: String,
    pub port: u16,
    pub bind_address: SocketAddr,
    pub upstream_url: Option<String>,

    // Admission policies
    pub anon_limit: u32,
    pub anon_window_ms: u64,
    pub auth_limit: u32,
    pub auth_window_ms: u64,
    pub anon_store: AnonStoreBackend,
    pub store_failure: StoreFailurePolicy,

    // Guard
    pub cors_allowed_origins: Vec<String>,
    pub jwt_secret: Option<String>,

    // Logging and housekeeping
    pub log_level: String,
    pub error_log_retention_days: u32,
    pub sweep_interval_secs: u64,
}

/// Validate all environment variables and return configuration or errors
pub fn validate_environment() -> Result<AppConfig, Vec<EnvValidationError>> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    // Database configuration
    let database_url = env::var("TURNSTILE_DB_URL").unwrap_or_else(|_| {
        warnings.push(EnvValidationError {
            variable: "TURNSTILE_DB_URL".to_string(),
            message: "Using default database URL 'sqlite://turnstile.db'".to_string(),
            severity: ErrorSeverity::Info,
        });
        "sqlite://turnstile.db".to_string()
    });

    // Server configuration
    let host = env::var("TURNSTILE_HOST").unwrap_or_else(|_| {
        warnings.push(EnvValidationError {
            variable: "TURNSTILE_HOST".to_string(),
            message: "Using default host '0.0.0.0'".to_string(),
            severity: ErrorSeverity::Info,
        });
        "0.0.0.0".to_string()
    });

    if IpAddr::from_str(&host).is_err() {
        errors.push(EnvValidationError {
            variable: "TURNSTILE_HOST".to_string(),
            message: format!("Invalid IP address: {}", host),
            severity: ErrorSeverity::Critical,
        });
    }

    let port = match env::var("TURNSTILE_PORT") {
        Ok(port_str) => match port_str.parse::<u16>() {
            Ok(port) => {
                if port < 1024 && port != 0 {
                    warnings.push(EnvValidationError {
                        variable: "TURNSTILE_PORT".to_string(),
                        message: format!(
                            "Using privileged port {}, may require root privileges",
                            port
                        ),
                        severity: ErrorSeverity::Warning,
                    });
                }
                port
            }
            Err(_) => {
                errors.push(EnvValidationError {
                    variable: "TURNSTILE_PORT".to_string(),
                    message: format!("Invalid port number: {}", port_str),
                    severity: ErrorSeverity::Critical,
                });
                3000 // fallback
            }
        },
        Err(_) => {
            warnings.push(EnvValidationError {
                variable: "TURNSTILE_PORT".to_string(),
                message: "Using default port 3000".to_string(),
                severity: ErrorSeverity::Info,
            });
            3000
        }
    };

    let bind_address = match format!("{}:{}", host, port).parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(_) => {
            errors.push(EnvValidationError {
                variable: "TURNSTILE_HOST/TURNSTILE_PORT".to_string(),
                message: format!("Cannot create valid socket address from {}:{}", host, port),
                severity: ErrorSeverity::Critical,
            });
            "0.0.0.0:3000".parse().unwrap() // fallback
        }
    };

    let upstream_url = match env::var("TURNSTILE_UPSTREAM_URL") {
        Ok(url) if url.starts_with("http://") || url.starts_with("https://") => Some(url),
        Ok(url) => {
            errors.push(EnvValidationError {
                variable: "TURNSTILE_UPSTREAM_URL".to_string(),
                message: format!("Upstream URL must be http(s), got: {}", url),
                severity: ErrorSeverity::Critical,
            });
            None
        }
        Err(_) => {
            warnings.push(EnvValidationError {
                variable: "TURNSTILE_UPSTREAM_URL".to_string(),
                message: "Not set; the start command will refuse to run".to_string(),
                severity: ErrorSeverity::Warning,
            });
            None
        }
    };

    // Admission policies. Zero limits or windows would deny everything or
    // divide the timeline into nothing, so both are rejected outright.
    let anon_limit: u32 = parse_env_var_with_default("TURNSTILE_ANON_LIMIT", 30, &mut warnings);
    let anon_window_ms: u64 =
        parse_env_var_with_default("TURNSTILE_ANON_WINDOW_MS", 60_000, &mut warnings);
    let auth_limit: u32 = parse_env_var_with_default("TURNSTILE_AUTH_LIMIT", 100, &mut warnings);
    let auth_window_ms: u64 =
        parse_env_var_with_default("TURNSTILE_AUTH_WINDOW_MS", 3_600_000, &mut warnings);

    for (variable, value) in [
        ("TURNSTILE_ANON_LIMIT", anon_limit as u64),
        ("TURNSTILE_ANON_WINDOW_MS", anon_window_ms),
        ("TURNSTILE_AUTH_LIMIT", auth_limit as u64),
        ("TURNSTILE_AUTH_WINDOW_MS", auth_window_ms),
    ] {
        if value == 0 {
            errors.push(EnvValidationError {
                variable: variable.to_string(),
                message: "Must be a positive integer".to_string(),
                severity: ErrorSeverity::Critical,
            });
        }
    }

    let anon_store = match env::var("TURNSTILE_ANON_STORE") {
        Ok(value) => match value.to_lowercase().as_str() {
            "sqlite" => AnonStoreBackend::Sqlite,
            "memory" => AnonStoreBackend::Memory,
            other => {
                warnings.push(EnvValidationError {
                    variable: "TURNSTILE_ANON_STORE".to_string(),
                    message: format!("Unknown backend '{}'. Using default: sqlite", other),
                    severity: ErrorSeverity::Warning,
                });
                AnonStoreBackend::Sqlite
            }
        },
        Err(_) => AnonStoreBackend::Sqlite,
    };

    let store_failure = match env::var("TURNSTILE_STORE_FAILURE") {
        Ok(value) => match value.to_lowercase().as_str() {
            "closed" => StoreFailurePolicy::Closed,
            "open" => StoreFailurePolicy::Open,
            other => {
                warnings.push(EnvValidationError {
                    variable: "TURNSTILE_STORE_FAILURE".to_string(),
                    message: format!("Unknown policy '{}'. Using default: closed", other),
                    severity: ErrorSeverity::Warning,
                });
                StoreFailurePolicy::Closed
            }
        },
        Err(_) => StoreFailurePolicy::Closed,
    };

    // Guard configuration
    let cors_allowed_origins: Vec<String> = env::var("TURNSTILE_CORS_ALLOWED_ORIGINS")
        .map(|origins| {
            origins
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect()
        })
        .unwrap_or_else(|_| {
            warnings.push(EnvValidationError {
                variable: "TURNSTILE_CORS_ALLOWED_ORIGINS".to_string(),
                message: "Not set; no origins will be echoed back".to_string(),
                severity: ErrorSeverity::Info,
            });
            Vec::new()
        });

    let jwt_secret = env::var("TURNSTILE_JWT_SECRET").ok();
    if jwt_secret.is_none() {
        warnings.push(EnvValidationError {
            variable: "TURNSTILE_JWT_SECRET".to_string(),
            message: "Not set; all callers are identified by IP only".to_string(),
            severity: ErrorSeverity::Info,
        });
    }

    // Logging configuration
    let log_level = env::var("TURNSTILE_LOG_LEVEL")
        .or_else(|_| env::var("RUST_LOG"))
        .unwrap_or_else(|_| {
            warnings.push(EnvValidationError {
                variable: "RUST_LOG/TURNSTILE_LOG_LEVEL".to_string(),
                message: "Using default log level 'turnstile=info,tower_http=debug'".to_string(),
                severity: ErrorSeverity::Info,
            });
            "turnstile=info,tower_http=debug".to_string()
        });

    let error_log_retention_days =
        parse_env_var_with_default("TURNSTILE_ERROR_LOG_RETENTION_DAYS", 7, &mut warnings);

    let sweep_interval_secs =
        parse_env_var_with_default("TURNSTILE_SWEEP_INTERVAL_SECS", 300, &mut warnings);

    // Add all warnings to errors for reporting
    errors.extend(warnings);

    let has_critical_errors = errors.iter().any(|e| e.severity == ErrorSeverity::Critical);
    if has_critical_errors {
        return Err(errors);
    }

    // Log non-critical issues
    for error in &errors {
        match error.severity {
            ErrorSeverity::Warning => warn!("{}: {}", error.variable, error.message),
            ErrorSeverity::Info => info!("{}: {}", error.variable, error.message),
            ErrorSeverity::Critical => {} // Already handled above
        }
    }

    Ok(AppConfig {
        database_url,
        host,
        port,
        bind_address,
        upstream_url,
        anon_limit,
        anon_window_ms,
        auth_limit,
        auth_window_ms,
        anon_store,
        store_failure,
        cors_allowed_origins,
        jwt_secret,
        log_level,
        error_log_retention_days,
        sweep_interval_secs,
    })
}

/// Get the validated configuration, exiting the process if validation fails
pub fn get_config() -> AppConfig {
    match validate_environment() {
        Ok(config) => config,
        Err(errors) => {
            eprintln!("Environment validation failed:");
            for error in errors {
                match error.severity {
                    ErrorSeverity::Critical => {
                        eprintln!("CRITICAL - {}: {}", error.variable, error.message)
                    }
                    ErrorSeverity::Warning => {
                        eprintln!("WARNING - {}: {}", error.variable, error.message)
                    }
                    ErrorSeverity::Info => {
                        eprintln!("INFO - {}: {}", error.variable, error.message)
                    }
                }
            }
            std::process::exit(1);
        }
    }
}

/// Database URL for CLI commands that only need the pool
pub fn database_url() -> String {
    env::var("TURNSTILE_DB_URL").unwrap_or_else(|_| "sqlite://turnstile.db".to_string())
}

/// Print environment validation results in a user-friendly format
pub fn print_validation_results(result: &Result<AppConfig, Vec<EnvValidationError>>) {
    match result {
        Ok(config) => {
            println!("Environment validation successful");
            println!("Configuration:");
            println!("  Database URL: {}", config.database_url);
            println!("  Server: {}", config.bind_address);
            println!(
                "  Upstream: {}",
                config.upstream_url.as_deref().unwrap_or("(not set)")
            );
            println!(
                "  Anonymous policy: {} requests / {} ms ({} store)",
                config.anon_limit,
                config.anon_window_ms,
                match config.anon_store {
                    AnonStoreBackend::Sqlite => "sqlite",
                    AnonStoreBackend::Memory => "memory",
                }
            );
            println!(
                "  Authenticated policy: {} requests / {} ms (memory store)",
                config.auth_limit, config.auth_window_ms
            );
            println!(
                "  Store failure policy: {}",
                match config.store_failure {
                    StoreFailurePolicy::Closed => "closed (503)",
                    StoreFailurePolicy::Open => "open (admit)",
                }
            );
            println!(
                "  CORS allowed origins: {}",
                if config.cors_allowed_origins.is_empty() {
                    "(none)".to_string()
                } else {
                    config.cors_allowed_origins.join(", ")
                }
            );
            println!("  Log Level: {}", config.log_level);
            println!(
                "  Error Log Retention: {} days",
                config.error_log_retention_days
            );
            println!("  Sweep Interval: {}s", config.sweep_interval_secs);
        }
        Err(errors) => {
            let critical_count = errors
                .iter()
                .filter(|e| e.severity == ErrorSeverity::Critical)
                .count();
            let warning_count = errors
                .iter()
                .filter(|e| e.severity == ErrorSeverity::Warning)
                .count();
            let info_count = errors
                .iter()
                .filter(|e| e.severity == ErrorSeverity::Info)
                .count();

            eprintln!(
                "Environment validation failed with {} critical error(s), {} warning(s), {} info message(s):",
                critical_count, warning_count, info_count
            );

            for error in errors {
                let prefix = match error.severity {
                    ErrorSeverity::Critical => "CRITICAL",
                    ErrorSeverity::Warning => "WARNING",
                    ErrorSeverity::Info => "INFO",
                };
                eprintln!("  {} - {}: {}", prefix, error.variable, error.message);
            }
        }
    }
}

/// Generate example environment configuration file
pub fn generate_env_example() -> String {
    r#"# Turnstile Admission Gateway Environment Configuration
# Copy this file to .env and customize the values for your deployment

# =============================================================================
# Database Configuration
# =============================================================================

# Database connection URL
# Default: sqlite://turnstile.db
TURNSTILE_DB_URL=sqlite://turnstile.db

# =============================================================================
# Server Configuration
# =============================================================================

# Server bind address
# Default: 0.0.0.0 (bind to all interfaces)
TURNSTILE_HOST=0.0.0.0

# Server port
# Default: 3000
TURNSTILE_PORT=3000

# Upstream base URL. Admitted requests are forwarded here.
# Required by the start command.
# TURNSTILE_UPSTREAM_URL=http://localhost:8080

# =============================================================================
# Admission Policies
# =============================================================================

# Anonymous (per-IP) fixed window
# Default: 30 requests per 60000 ms
TURNSTILE_ANON_LIMIT=30
TURNSTILE_ANON_WINDOW_MS=60000

# Authenticated (per-user) fixed window
# Default: 100 requests per 3600000 ms
TURNSTILE_AUTH_LIMIT=100
TURNSTILE_AUTH_WINDOW_MS=3600000

# Bucket backend for the anonymous policy: sqlite or memory
# sqlite survives restarts and is shared between instances on one database;
# memory is per-process and vanishes on restart
TURNSTILE_ANON_STORE=sqlite

# What to do when the bucket store is unavailable: closed (reject with 503)
# or open (admit and log)
TURNSTILE_STORE_FAILURE=closed

# =============================================================================
# Guard Configuration
# =============================================================================

# Comma-separated CORS origin allow-list. Origins not on the list are never
# echoed back in Access-Control-Allow-Origin.
# TURNSTILE_CORS_ALLOWED_ORIGINS=https://app.example.com,https://admin.example.com

# HMAC secret for bearer tokens. When set, a valid token's `sub` claim is
# used as the caller identity and the authenticated policy applies.
# TURNSTILE_JWT_SECRET=your-super-secret-key-here

# =============================================================================
# Logging and Housekeeping
# =============================================================================

# Log level configuration
# Default: turnstile=info,tower_http=debug
RUST_LOG=turnstile=info,tower_http=debug

# Error log retention in days
# Default: 7
TURNSTILE_ERROR_LOG_RETENTION_DAYS=7

# Expired-bucket sweep cadence in seconds
# Default: 300
TURNSTILE_SWEEP_INTERVAL_SECS=300
"#
    .to_string()
}

/// Helper function to parse environment variable with default value
fn parse_env_var_with_default<T>(
    var_name: &str,
    default: T,
    warnings: &mut Vec<EnvValidationError>,
) -> T
where
    T: FromStr + Clone + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match env::var(var_name) {
        Ok(value_str) => match value_str.parse::<T>() {
            Ok(value) => value,
            Err(e) => {
                warnings.push(EnvValidationError {
                    variable: var_name.to_string(),
                    message: format!(
                        "Invalid value '{}': {}. Using default: {}",
                        value_str, e, default
                    ),
                    severity: ErrorSeverity::Warning,
                });
                default
            }
        },
        Err(_) => {
            warnings.push(EnvValidationError {
                variable: var_name.to_string(),
                message: format!("Using default value: {}", default),
                severity: ErrorSeverity::Info,
            });
            default
        }
    }
}
