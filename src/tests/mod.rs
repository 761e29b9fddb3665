//! Integration tests: CLI commands via the built binary, guard behavior
//! against a running server.

mod guard_tests;

use assert_cmd::Command;
use predicates::str::contains;
use tokio::runtime::Runtime;

fn temp_db_url(name: &str) -> String {
    let path = std::env::temp_dir().join(format!(
        "turnstile-test-{}-{}.db",
        name,
        uuid::Uuid::new_v4()
    ));
    format!("sqlite://{}", path.display())
}

#[test]
fn env_example_lists_variables() {
    let mut cmd = Command::cargo_bin("turnstile").unwrap();
    cmd.arg("env-example");
    cmd.assert()
        .success()
        .stdout(contains("TURNSTILE_UPSTREAM_URL"))
        .stdout(contains("TURNSTILE_ANON_LIMIT"))
        .stdout(contains("TURNSTILE_STORE_FAILURE"));
}

#[test]
fn validate_env_rejects_bad_port() {
    let mut cmd = Command::cargo_bin("turnstile").unwrap();
    cmd.arg("validate-env").env("TURNSTILE_PORT", "not-a-port");
    cmd.assert()
        .failure()
        .stderr(contains("TURNSTILE_PORT"));
}

#[test]
fn reset_bucket_reports_missing_identity() {
    let mut cmd = Command::cargo_bin("turnstile").unwrap();
    cmd.arg("reset-bucket")
        .arg("--identity")
        .arg("203.0.113.9")
        .env("TURNSTILE_DB_URL", temp_db_url("reset"));
    cmd.assert()
        .success()
        .stdout(contains("No bucket found for: 203.0.113.9"));
}

#[test]
fn list_buckets_shows_persisted_rows() {
    let db_url = temp_db_url("list");

    // Create the schema, then seed one bucket the way the gateway would.
    let mut cmd = Command::cargo_bin("turnstile").unwrap();
    cmd.arg("migrate").env("TURNSTILE_DB_URL", &db_url);
    cmd.assert().success();

    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let pool = sqlx::sqlite::SqlitePool::connect(&db_url).await.unwrap();
        sqlx::query("INSERT INTO buckets (identity, count, window_start_ms) VALUES (?, ?, ?)")
            .bind("203.0.113.7")
            .bind(12i64)
            .bind(1_700_000_000_000i64)
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
    });

    let mut cmd = Command::cargo_bin("turnstile").unwrap();
    cmd.arg("list-buckets").env("TURNSTILE_DB_URL", &db_url);
    cmd.assert()
        .success()
        .stdout(contains("203.0.113.7"))
        .stdout(contains("1 bucket(s)"));
}

#[test]
fn migrate_is_idempotent() {
    let db_url = temp_db_url("migrate");

    let mut cmd = Command::cargo_bin("turnstile").unwrap();
    cmd.arg("migrate").env("TURNSTILE_DB_URL", &db_url);
    cmd.assert()
        .success()
        .stdout(contains("All pending migrations applied."));

    // Second run sees nothing pending and still succeeds.
    let mut cmd = Command::cargo_bin("turnstile").unwrap();
    cmd.arg("migrate").env("TURNSTILE_DB_URL", &db_url);
    cmd.assert()
        .success()
        .stdout(contains("Pending migrations: []"));
}
