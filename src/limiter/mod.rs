//! # Admission Limiter Module
//!
//! This module decides whether a request identified by a caller identity may
//! proceed, using a fixed-window counter per identity. It is the single
//! admission implementation in the gateway; the choice of bucket storage
//! (in-process map or SQLite) is injected, not duplicated.
//!
//! ## Admission Strategy
//!
//! - **Fixed window**: the first request from an identity opens a window and
//!   sets its count to 1; requests inside the window increment the count;
//!   a request at or past the limit is denied without touching the counter.
//! - **Hard reset**: once the window has fully elapsed the next request opens
//!   a fresh window at count 1. A burst straddling the boundary can therefore
//!   see up to twice the limit admitted in quick succession; that is the
//!   accepted tradeoff of this design, not a defect.
//! - **Boundary checks are `>=`**: the request exactly at the limit is
//!   denied, and the request exactly at window expiry opens a new window.
//!
//! ## Concurrency
//!
//! The evaluator never holds a lock across its read and write. Instead every
//! write is a compare-and-swap against the bucket it read, retried a bounded
//! number of times. Retry exhaustion is reported as a store failure so the
//! guard's failure policy applies.

pub mod clock;
pub mod persisted;
pub mod store;

use self::clock::Clock;
use self::store::{Bucket, BucketStore, StoreError};
use std::sync::Arc;
use tracing::{debug, warn};

/// CAS attempts before a check is declared unserviceable. Contention on a
/// single identity resolves in one or two rounds in practice.
const MAX_WRITE_ATTEMPTS: u32 = 4;

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Fixed-window admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    /// Requests admitted per identity per window. Must be positive.
    pub limit: u32,
    /// Window length in milliseconds. Must be positive.
    pub window_ms: u64,
}

impl AdmissionPolicy {
    pub fn new(limit: u32, window_ms: u64) -> Self {
        debug_assert!(limit > 0, "admission limit must be positive");
        debug_assert!(window_ms > 0, "admission window must be positive");
        Self { limit, window_ms }
    }
}

/// The outcome of an admission check. Denial is normal control flow, not an
/// error; store trouble is reported separately as [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed; `remaining` is the quota left in the window.
    Allowed { remaining: u32 },
    /// The identity has exhausted its quota for the current window.
    Denied,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// Admission evaluator over an injected bucket store and clock.
#[derive(Clone)]
pub struct AdmissionEvaluator {
    store: Arc<dyn BucketStore>,
    policy: AdmissionPolicy,
    clock: Arc<dyn Clock>,
}

impl AdmissionEvaluator {
    pub fn new(store: Arc<dyn BucketStore>, policy: AdmissionPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    /// Check whether a request from `identity` may proceed, updating the
    /// identity's bucket on admission.
    pub async fn check(&self, identity: &str) -> Result<Decision, StoreError> {
        for attempt in 0..MAX_WRITE_ATTEMPTS {
            let current = self.store.read(identity).await?;
            let now = self.clock.now_ms();

            let next = match current {
                // Window still active. Wall clock regressions read as a
                // zero-elapsed window via saturating_sub.
                Some(bucket)
                    if now.saturating_sub(bucket.window_start_ms) < self.policy.window_ms =>
                {
                    if bucket.count >= self.policy.limit {
                        debug!(
                            identity = %identity,
                            count = bucket.count,
                            limit = self.policy.limit,
                            "admission denied, window quota exhausted"
                        );
                        return Ok(Decision::Denied);
                    }
                    Bucket {
                        count: bucket.count + 1,
                        ..bucket
                    }
                }
                // Absent or expired: open a fresh window.
                _ => Bucket {
                    count: 1,
                    window_start_ms: now,
                },
            };

            if self.store.write(identity, next, current).await? {
                debug!(
                    identity = %identity,
                    count = next.count,
                    limit = self.policy.limit,
                    "admission check passed"
                );
                return Ok(Decision::Allowed {
                    remaining: self.policy.limit - next.count,
                });
            }

            debug!(identity = %identity, attempt, "bucket write lost a race, retrying");
        }

        warn!(
            identity = %identity,
            attempts = MAX_WRITE_ATTEMPTS,
            "bucket store contention, giving up"
        );
        Err(StoreError::Unavailable(
            "bucket write contention: retries exhausted".to_string(),
        ))
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
