//! SQLite-backed bucket store.
//!
//! Buckets live in the `buckets` table, so counters survive restarts and are
//! shared by every gateway instance pointing at the same database file. Each
//! compare-and-swap arm is a single conditional statement; `rows_affected`
//! is the race signal. There is deliberately no read-then-write pair here:
//! two concurrent checks for the same identity can never lose an increment,
//! the loser's condition simply stops matching and the evaluator re-reads.

use super::store::{Bucket, BucketStore, StoreError};
use async_trait::async_trait;
use sqlx::{Row, sqlite::SqlitePool};

/// Durable store over the shared SQLite pool.
#[derive(Debug, Clone)]
pub struct SqliteBucketStore {
    pool: SqlitePool,
}

impl SqliteBucketStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Delete buckets whose window ended before `now_ms`, returning how many
    /// rows were removed. Called by the background sweep.
    pub async fn sweep_expired(&self, now_ms: u64, window_ms: u64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM buckets WHERE ? - window_start_ms >= ?")
            .bind(now_ms as i64)
            .bind(window_ms as i64)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected())
    }
}

fn unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl BucketStore for SqliteBucketStore {
    async fn read(&self, identity: &str) -> Result<Option<Bucket>, StoreError> {
        let row = sqlx::query("SELECT count, window_start_ms FROM buckets WHERE identity = ?")
            .bind(identity)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        Ok(row.map(|row| Bucket {
            count: row.get::<i64, _>("count") as u32,
            window_start_ms: row.get::<i64, _>("window_start_ms") as u64,
        }))
    }

    async fn write(
        &self,
        identity: &str,
        bucket: Bucket,
        expected: Option<Bucket>,
    ) -> Result<bool, StoreError> {
        let result = match expected {
            // Fresh identity: only wins if nobody created the row meanwhile.
            None => {
                sqlx::query(
                    "INSERT INTO buckets (identity, count, window_start_ms)
                     VALUES (?, ?, ?)
                     ON CONFLICT(identity) DO NOTHING",
                )
                .bind(identity)
                .bind(bucket.count as i64)
                .bind(bucket.window_start_ms as i64)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?
            }
            // Existing bucket: only wins if the row is unchanged since read.
            Some(expected) => {
                sqlx::query(
                    "UPDATE buckets SET count = ?, window_start_ms = ?
                     WHERE identity = ? AND count = ? AND window_start_ms = ?",
                )
                .bind(bucket.count as i64)
                .bind(bucket.window_start_ms as i64)
                .bind(identity)
                .bind(expected.count as i64)
                .bind(expected.window_start_ms as i64)
                .execute(&self.pool)
                .await
                .map_err(unavailable)?
            }
        };

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test database");

        sqlx::query(
            "CREATE TABLE buckets (
                identity TEXT PRIMARY KEY,
                count INTEGER NOT NULL,
                window_start_ms INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .expect("Failed to create test table");

        pool
    }

    #[tokio::test]
    async fn read_absent_identity() {
        let store = SqliteBucketStore::new(create_test_pool().await);
        assert_eq!(store.read("1.1.1.1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn create_then_update_round_trip() {
        let store = SqliteBucketStore::new(create_test_pool().await);
        let first = Bucket {
            count: 1,
            window_start_ms: 1_000,
        };

        assert!(store.write("1.1.1.1", first, None).await.unwrap());
        assert_eq!(store.read("1.1.1.1").await.unwrap(), Some(first));

        let second = Bucket {
            count: 2,
            window_start_ms: 1_000,
        };
        assert!(store.write("1.1.1.1", second, Some(first)).await.unwrap());
        assert_eq!(store.read("1.1.1.1").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn stale_expected_loses_the_race() {
        let store = SqliteBucketStore::new(create_test_pool().await);
        let first = Bucket {
            count: 1,
            window_start_ms: 1_000,
        };
        assert!(store.write("u1", first, None).await.unwrap());

        // Duplicate create loses.
        assert!(!store.write("u1", first, None).await.unwrap());

        // Update conditioned on a bucket that has since changed loses and
        // leaves the stored row untouched.
        let second = Bucket {
            count: 2,
            window_start_ms: 1_000,
        };
        assert!(store.write("u1", second, Some(first)).await.unwrap());
        assert!(!store.write("u1", second, Some(first)).await.unwrap());
        assert_eq!(store.read("u1").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_windows() {
        let store = SqliteBucketStore::new(create_test_pool().await);
        let live = Bucket {
            count: 3,
            window_start_ms: 50_000,
        };
        let expired = Bucket {
            count: 7,
            window_start_ms: 0,
        };
        store.write("live", live, None).await.unwrap();
        store.write("expired", expired, None).await.unwrap();

        let removed = store.sweep_expired(60_000, 60_000).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.read("live").await.unwrap(), Some(live));
        assert_eq!(store.read("expired").await.unwrap(), None);
    }
}
