//! End-to-end guard tests: a real gateway server in front of a real (tiny)
//! upstream, driven over HTTP.

use crate::database::DatabaseManager;
use crate::env::{AnonStoreBackend, AppConfig, StoreFailurePolicy};
use crate::guard::guard_middleware;
use crate::server::{create_app_state, serve_with_shutdown};
use axum::routing::get;
use axum::{Router, middleware};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

///////////////////////////////////////////////////////////////////////////////
//****                            Helpers                                ****//
///////////////////////////////////////////////////////////////////////////////

fn test_config(upstream_url: &str) -> AppConfig {
    AppConfig {
        database_url: "sqlite://unused-in-tests".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        bind_address: "127.0.0.1:0".parse().unwrap(),
        upstream_url: Some(upstream_url.to_string()),
        anon_limit: 30,
        anon_window_ms: 60_000,
        auth_limit: 100,
        auth_window_ms: 3_600_000,
        anon_store: AnonStoreBackend::Sqlite,
        store_failure: StoreFailurePolicy::Closed,
        cors_allowed_origins: vec!["https://app.example.com".to_string()],
        jwt_secret: None,
        log_level: "turnstile=warn".to_string(),
        error_log_retention_days: 7,
        sweep_interval_secs: 300,
    }
}

async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test database");
    let manager = DatabaseManager::new(pool.clone());
    manager.initialize().await.expect("initialize failed");
    manager
        .apply_pending_migrations()
        .await
        .expect("migrations failed");
    pool
}

/// Tiny upstream that counts how often it is actually invoked.
async fn spawn_upstream() -> (SocketAddr, Arc<AtomicUsize>, oneshot::Sender<()>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_handler = hits.clone();
    let app = Router::new().route(
        "/echo",
        get(move || {
            let hits = hits_for_handler.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                "upstream ok"
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                rx.await.ok();
            })
            .await
            .unwrap();
    });
    (addr, hits, tx)
}

/// Spawn the full gateway over the given pool and config.
async fn spawn_gateway(pool: SqlitePool, config: AppConfig) -> (SocketAddr, oneshot::Sender<()>) {
    let (state, _sweep) = create_app_state(pool, config).expect("state should build");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(serve_with_shutdown(listener, state, rx));
    (addr, tx)
}

#[derive(Serialize)]
struct TestClaims {
    sub: String,
    exp: usize,
}

fn bearer_token(sub: &str, secret: &str) -> String {
    encode(
        &Header::default(),
        &TestClaims {
            sub: sub.to_string(),
            exp: 4_102_444_800, // 2100-01-01
        },
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////

#[tokio::test]
async fn preflight_short_circuits_without_counting() {
    let (upstream_addr, hits, _upstream_tx) = spawn_upstream().await;
    let pool = test_pool().await;
    let config = test_config(&format!("http://{}", upstream_addr));
    let (addr, _tx) = spawn_gateway(pool.clone(), config).await;

    let client = reqwest::Client::new();
    let response = client
        .request(reqwest::Method::OPTIONS, format!("http://{}/echo", addr))
        .header("Origin", "https://app.example.com")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 204);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "https://app.example.com"
    );
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-methods")
            .unwrap(),
        "POST, GET, OPTIONS"
    );

    // The delegate never ran and no quota was consumed.
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    let buckets: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM buckets")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(buckets, 0);
}

#[tokio::test]
async fn denies_past_the_anonymous_limit() {
    let (upstream_addr, hits, _upstream_tx) = spawn_upstream().await;
    let pool = test_pool().await;
    let mut config = test_config(&format!("http://{}", upstream_addr));
    config.anon_limit = 2;
    let (addr, _tx) = spawn_gateway(pool, config).await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        let response = client
            .get(format!("http://{}/echo", addr))
            .header("x-real-ip", "1.1.1.1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "upstream ok");
    }

    let response = client
        .get(format!("http://{}/echo", addr))
        .header("x-real-ip", "1.1.1.1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 429);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "error": "Too many requests." }));

    // The denied request never reached the upstream.
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn identities_do_not_share_quota() {
    let (upstream_addr, _hits, _upstream_tx) = spawn_upstream().await;
    let pool = test_pool().await;
    let mut config = test_config(&format!("http://{}", upstream_addr));
    config.anon_limit = 1;
    let (addr, _tx) = spawn_gateway(pool, config).await;

    let client = reqwest::Client::new();
    let first = client
        .get(format!("http://{}/echo", addr))
        .header("x-real-ip", "1.1.1.1")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    let denied = client
        .get(format!("http://{}/echo", addr))
        .header("x-real-ip", "1.1.1.1")
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 429);

    let other = client
        .get(format!("http://{}/echo", addr))
        .header("x-real-ip", "2.2.2.2")
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), 200);
}

#[tokio::test]
async fn health_endpoint_is_unguarded() {
    let (upstream_addr, _hits, _upstream_tx) = spawn_upstream().await;
    let pool = test_pool().await;
    let mut config = test_config(&format!("http://{}", upstream_addr));
    config.anon_limit = 1;
    let (addr, _tx) = spawn_gateway(pool, config).await;

    let client = reqwest::Client::new();
    // Exhaust the quota first.
    client
        .get(format!("http://{}/echo", addr))
        .header("x-real-ip", "1.1.1.1")
        .send()
        .await
        .unwrap();

    let health = client
        .get(format!("http://{}/health", addr))
        .header("x-real-ip", "1.1.1.1")
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn delegate_panic_answers_500_without_leaking() {
    let pool = test_pool().await;
    let config = test_config("http://127.0.0.1:9"); // never called
    let (state, _sweep) = create_app_state(pool, config).expect("state should build");

    async fn boom() -> &'static str {
        panic!("boom payload");
    }

    let app = Router::new()
        .route("/boom", get(boom))
        .layer(middleware::from_fn_with_state(state, guard_middleware));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            rx.await.ok();
        })
        .await
        .unwrap();
    });

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/boom", addr))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    let body = response.text().await.unwrap();
    assert_eq!(body, r#"{"error":"An internal error occurred."}"#);
    assert!(!body.contains("boom payload"));

    // The server survived the panic.
    let response = client
        .get(format!("http://{}/boom", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
}

#[tokio::test]
async fn store_failure_rejects_when_fail_closed() {
    let (upstream_addr, hits, _upstream_tx) = spawn_upstream().await;
    let pool = test_pool().await;
    let config = test_config(&format!("http://{}", upstream_addr));
    let (addr, _tx) = spawn_gateway(pool.clone(), config).await;

    // Take the bucket store away.
    pool.close().await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/echo", addr))
        .header("x-real-ip", "1.1.1.1")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        body,
        serde_json::json!({ "error": "Service temporarily unavailable." })
    );
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn store_failure_admits_when_fail_open() {
    let (upstream_addr, hits, _upstream_tx) = spawn_upstream().await;
    let pool = test_pool().await;
    let mut config = test_config(&format!("http://{}", upstream_addr));
    config.store_failure = StoreFailurePolicy::Open;
    let (addr, _tx) = spawn_gateway(pool.clone(), config).await;

    pool.close().await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/echo", addr))
        .header("x-real-ip", "1.1.1.1")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "upstream ok");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bearer_token_selects_the_per_user_policy() {
    let (upstream_addr, _hits, _upstream_tx) = spawn_upstream().await;
    let pool = test_pool().await;
    let mut config = test_config(&format!("http://{}", upstream_addr));
    config.jwt_secret = Some("test-secret".to_string());
    config.auth_limit = 1;
    let (addr, _tx) = spawn_gateway(pool, config).await;

    let token = bearer_token("u1", "test-secret");
    let client = reqwest::Client::new();

    let first = client
        .get(format!("http://{}/echo", addr))
        .header("authorization", format!("Bearer {}", token))
        .header("x-real-ip", "1.1.1.1")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);

    // Second call for the same user exceeds the per-user limit.
    let second = client
        .get(format!("http://{}/echo", addr))
        .header("authorization", format!("Bearer {}", token))
        .header("x-real-ip", "1.1.1.1")
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 429);

    // The same IP without a token uses the anonymous policy, which still
    // has quota left.
    let anonymous = client
        .get(format!("http://{}/echo", addr))
        .header("x-real-ip", "1.1.1.1")
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), 200);
}
