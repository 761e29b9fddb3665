//! # Bucket Store Module
//!
//! Storage backends for admission buckets. A bucket is one caller's usage
//! counter for the current window; stores only hold and swap buckets, the
//! window arithmetic lives in the evaluator.
//!
//! ## Write Semantics
//!
//! `BucketStore::write` is a compare-and-swap: the new bucket is stored only
//! when the currently stored value still matches what the caller read
//! (`expected`). A `false` return means a concurrent writer got there first
//! and the caller must re-read. This keeps read-modify-write safe without a
//! cross-request lock, for both the in-process map and the SQLite backend.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// One caller's usage window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Admitted requests in the current window.
    pub count: u32,
    /// When the current window began, milliseconds since the Unix epoch.
    pub window_start_ms: u64,
}

/// Errors surfaced by bucket stores.
#[derive(Debug)]
pub enum StoreError {
    /// The backing store could not be reached or returned an error.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Unavailable(detail) => {
                write!(f, "bucket store unavailable: {}", detail)
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Storage for admission buckets.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Fetch the stored bucket for an identity. Expired buckets are returned
    /// as-is; deciding whether a bucket is still live is the evaluator's job.
    async fn read(&self, identity: &str) -> Result<Option<Bucket>, StoreError>;

    /// Compare-and-swap write. `expected` must be exactly what `read`
    /// returned; `Ok(false)` signals a lost race, not a failure.
    async fn write(
        &self,
        identity: &str,
        bucket: Bucket,
        expected: Option<Bucket>,
    ) -> Result<bool, StoreError>;
}

/// Volatile in-process store. Buckets vanish on restart and are not shared
/// between instances; suitable for per-instance policies only.
#[derive(Debug, Default)]
pub struct InMemoryBucketStore {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop buckets whose window ended before `now_ms`, returning how many
    /// were removed. Expiry is otherwise lazy, so without this the map grows
    /// by one entry per identity ever seen.
    pub fn sweep_expired(&self, now_ms: u64, window_ms: u64) -> usize {
        let mut buckets = self.buckets.lock().unwrap();
        let before = buckets.len();
        buckets.retain(|_, b| now_ms.saturating_sub(b.window_start_ms) < window_ms);
        before - buckets.len()
    }

    /// Number of live entries, for logs and tests.
    pub fn len(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BucketStore for InMemoryBucketStore {
    async fn read(&self, identity: &str) -> Result<Option<Bucket>, StoreError> {
        let buckets = self.buckets.lock().unwrap();
        Ok(buckets.get(identity).copied())
    }

    async fn write(
        &self,
        identity: &str,
        bucket: Bucket,
        expected: Option<Bucket>,
    ) -> Result<bool, StoreError> {
        let mut buckets = self.buckets.lock().unwrap();
        if buckets.get(identity).copied() != expected {
            return Ok(false);
        }
        buckets.insert(identity.to_string(), bucket);
        Ok(true)
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
