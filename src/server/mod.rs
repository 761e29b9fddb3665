//! Server module for the Turnstile admission gateway.
//!
//! This module wires the shared state together, builds the guarded router,
//! and runs the serve loop with graceful shutdown. It also owns the
//! background housekeeping: pruning expired buckets (the lazy-expiry model
//! never deletes on the request path) and trimming old error logs.
//!
//! # Request Surface
//!
//! - `/health` answers `OK` outside the guard
//! - every other path is guarded and proxied to the configured upstream

pub mod shutdown;

use self::shutdown::{ShutdownAwareTask, ShutdownCoordinator};
use crate::AppState;
use crate::env::{AnonStoreBackend, AppConfig};
use crate::guard::cors::CorsConfig;
use crate::guard::guard_middleware;
use crate::limiter::clock::SystemClock;
use crate::limiter::persisted::SqliteBucketStore;
use crate::limiter::store::InMemoryBucketStore;
use crate::limiter::{AdmissionEvaluator, AdmissionPolicy};
use crate::logging::errors::cleanup_old_error_logs;
use crate::upstream::{handle_request_no_body, handle_request_with_body};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Router, middleware};
use sqlx::sqlite::SqlitePool;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Store handles the background sweep prunes, paired with the window length
/// that decides expiry for each.
#[derive(Clone)]
pub struct SweepHandles {
    pub sqlite: Option<(SqliteBucketStore, u64)>,
    pub memory: Vec<(Arc<InMemoryBucketStore>, u64)>,
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Build the shared application state and the sweep handles for it.
///
/// Fails when no upstream URL is configured; the gateway has nothing to
/// guard without one.
pub fn create_app_state(
    pool: SqlitePool,
    config: AppConfig,
) -> Result<(AppState, SweepHandles), String> {
    let upstream_url = config
        .upstream_url
        .clone()
        .ok_or_else(|| "TURNSTILE_UPSTREAM_URL must be set to start the gateway".to_string())?;

    let clock = Arc::new(SystemClock);
    let mut sweep = SweepHandles {
        sqlite: None,
        memory: Vec::new(),
    };

    let anon_policy = AdmissionPolicy::new(config.anon_limit, config.anon_window_ms);
    let anon_evaluator = match config.anon_store {
        AnonStoreBackend::Sqlite => {
            let store = SqliteBucketStore::new(pool.clone());
            sweep.sqlite = Some((store.clone(), config.anon_window_ms));
            AdmissionEvaluator::new(Arc::new(store), anon_policy, clock.clone())
        }
        AnonStoreBackend::Memory => {
            let store = Arc::new(InMemoryBucketStore::new());
            sweep.memory.push((store.clone(), config.anon_window_ms));
            AdmissionEvaluator::new(store, anon_policy, clock.clone())
        }
    };

    // The authenticated tier is always per-process: user buckets are small
    // and the policy tolerates a reset on restart.
    let auth_store = Arc::new(InMemoryBucketStore::new());
    sweep.memory.push((auth_store.clone(), config.auth_window_ms));
    let auth_evaluator = AdmissionEvaluator::new(
        auth_store,
        AdmissionPolicy::new(config.auth_limit, config.auth_window_ms),
        clock,
    );

    let state = AppState {
        db: pool,
        http_client: reqwest::Client::new(),
        anon_evaluator,
        auth_evaluator,
        cors: CorsConfig::new(config.cors_allowed_origins.clone()),
        upstream_url,
        config,
    };

    Ok((state, sweep))
}

/// Build the guarded router over the shared state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/{*path}", get(handle_request_no_body))
        .route("/{*path}", axum::routing::head(handle_request_no_body))
        .route("/{*path}", axum::routing::delete(handle_request_no_body))
        .route("/{*path}", axum::routing::post(handle_request_with_body))
        .route("/{*path}", axum::routing::put(handle_request_with_body))
        .route("/{*path}", axum::routing::patch(handle_request_with_body))
        // Preflights never reach the method router; the guard answers them.
        .route(
            "/{*path}",
            axum::routing::options(|| async { StatusCode::NO_CONTENT }),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            guard_middleware,
        ))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the gateway with graceful shutdown support.
pub async fn start_server(pool: SqlitePool, config: AppConfig) {
    let shutdown_coordinator = Arc::new(ShutdownCoordinator::new());

    let (state, sweep_handles) = match create_app_state(pool.clone(), config.clone()) {
        Ok(parts) => parts,
        Err(message) => {
            error!("{}", message);
            std::process::exit(1);
        }
    };

    let app = build_router(state);

    start_background_services(pool, &config, sweep_handles, shutdown_coordinator.clone());

    let listener = match tokio::net::TcpListener::bind(config.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind {}: {}", config.bind_address, err);
            std::process::exit(1);
        }
    };
    let addr = listener.local_addr().expect("listener has a local address");
    info!("Turnstile running on http://{}", addr);
    info!(
        "Guarding upstream {}",
        state_upstream_for_log(&config)
    );

    let shutdown_for_server = shutdown_coordinator.clone();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_for_server.wait_for_shutdown_signal().await;
    });

    if let Err(err) = server.await {
        error!("Turnstile server error: {}", err);
    }

    info!("Turnstile shutdown complete");
}

/// Serve an already-bound listener until the shutdown signal fires. Used by
/// the end-to-end tests, which need the bound address before serving.
pub async fn serve_with_shutdown(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) {
    let app = build_router(state);

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        shutdown_rx.await.ok();
    });

    if let Err(err) = server.await {
        error!("Turnstile server error: {}", err);
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                       Private Functions                           ****//
///////////////////////////////////////////////////////////////////////////////

fn state_upstream_for_log(config: &AppConfig) -> String {
    config
        .upstream_url
        .clone()
        .unwrap_or_else(|| "(unset)".to_string())
}

/// Spawn the housekeeping task: prune expired buckets and trim old error
/// logs on the configured cadence, until shutdown.
fn start_background_services(
    pool: SqlitePool,
    config: &AppConfig,
    handles: SweepHandles,
    coordinator: Arc<ShutdownCoordinator>,
) {
    let interval = Duration::from_secs(config.sweep_interval_secs);
    let retention_days = config.error_log_retention_days;

    tokio::spawn(async move {
        let mut task = ShutdownAwareTask::new(&coordinator);
        loop {
            if task.wait_or_shutdown(interval).await {
                info!("Housekeeping task shutting down");
                break;
            }

            let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;

            if let Some((store, window_ms)) = &handles.sqlite {
                match store.sweep_expired(now_ms, *window_ms).await {
                    Ok(removed) if removed > 0 => {
                        debug!("Swept {} expired persisted buckets", removed)
                    }
                    Ok(_) => {}
                    Err(err) => warn!("Persisted bucket sweep failed: {}", err),
                }
            }

            for (store, window_ms) in &handles.memory {
                let removed = store.sweep_expired(now_ms, *window_ms);
                if removed > 0 {
                    debug!("Swept {} expired in-memory buckets", removed);
                }
            }

            match cleanup_old_error_logs(&pool, retention_days).await {
                Ok(deleted) if deleted > 0 => debug!("Cleaned up {} old error logs", deleted),
                Ok(_) => {}
                Err(err) => warn!("Error log cleanup failed: {}", err),
            }
        }
    });
}
