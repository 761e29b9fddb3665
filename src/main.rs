//! Turnstile: a request admission gateway.
//!
//! Inbound requests pass a guard (CORS, per-identity fixed-window rate
//! limiting, error isolation) before being proxied to the configured
//! upstream. See the `guard` and `limiter` modules for the admission core.

mod cli;
mod database;
mod env;
mod guard;
mod limiter;
mod logging;
mod server;
mod upstream;

#[cfg(test)]
mod tests;

use env::AppConfig;
use guard::cors::CorsConfig;
use limiter::AdmissionEvaluator;
use sqlx::sqlite::SqlitePool;

/// Shared state for the guarded routes.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub http_client: reqwest::Client,
    /// Per-IP admission, backed by the configured anonymous store.
    pub anon_evaluator: AdmissionEvaluator,
    /// Per-user admission for callers with a valid bearer token.
    pub auth_evaluator: AdmissionEvaluator,
    pub cors: CorsConfig,
    pub upstream_url: String,
    pub config: AppConfig,
}

#[tokio::main]
async fn main() {
    cli::run().await;
}
