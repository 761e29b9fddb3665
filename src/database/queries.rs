//! # Database Queries Module
//!
//! Centralizes the SQL used by the CLI and background sweeps, so the
//! statements stay in one place instead of being scattered through command
//! handlers. The admission hot path does not go through here; the bucket
//! store owns its own statements.

use sqlx::{Row, sqlite::SqlitePool};

///////////////////////////////////////////////////////////////////////////////
//****                         Bucket Queries                            ****//
///////////////////////////////////////////////////////////////////////////////

/// A persisted bucket row as shown by the CLI.
#[derive(Debug, Clone)]
pub struct BucketRow {
    pub identity: String,
    pub count: i64,
    pub window_start_ms: i64,
}

/// Fetch all persisted buckets, most recently opened window first
pub async fn fetch_all_buckets(pool: &SqlitePool) -> Result<Vec<BucketRow>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT identity, count, window_start_ms FROM buckets ORDER BY window_start_ms DESC",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| BucketRow {
            identity: row.get("identity"),
            count: row.get("count"),
            window_start_ms: row.get("window_start_ms"),
        })
        .collect())
}

/// Delete the bucket for one identity, returning whether a row existed
pub async fn delete_bucket(pool: &SqlitePool, identity: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM buckets WHERE identity = ?")
        .bind(identity)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Count persisted buckets
pub async fn count_buckets(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM buckets")
        .fetch_one(pool)
        .await
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
