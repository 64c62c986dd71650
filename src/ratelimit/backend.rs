//! Counter backend trait and the result type handed back to callers.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::error::BackendError;

/// Observation made by a backend after counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowHit {
    /// Requests observed in the window, including this one
    pub count: u64,
    /// When enough of the window has passed for the count to drop
    pub reset: DateTime<Utc>,
}

/// Trait for distributed counter backends.
///
/// Implementations must count and check atomically so that concurrent
/// callers on different instances agree on the total.
#[async_trait]
pub trait CounterBackend: Send + Sync {
    /// Count one request against `key` in a sliding window of `window`
    /// ending at `now`, recording it only while the total stays within
    /// `limit`.
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<WindowHit, BackendError>;
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub success: bool,
    /// Configured threshold of the binding constraint
    pub limit: u32,
    /// Requests left before the binding constraint blocks
    pub remaining: u32,
    /// When the binding constraint resets
    pub reset: DateTime<Utc>,
}

impl RateLimitResult {
    /// Build a result from an observed count.
    pub fn from_count(limit: u32, observed: u64, reset: DateTime<Utc>) -> Self {
        Self {
            success: observed <= u64::from(limit),
            limit,
            remaining: u64::from(limit).saturating_sub(observed) as u32,
            reset,
        }
    }

    pub fn from_hit(limit: u32, hit: WindowHit) -> Self {
        Self::from_count(limit, hit.count, hit.reset)
    }

    /// Result reported when a request is exempt from limiting.
    pub fn unlimited(limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            success: true,
            limit,
            remaining: limit,
            reset: now,
        }
    }

    /// AND-combine sub-checks, surfacing the most restrictive constraint.
    ///
    /// Returns `None` for an empty input.
    pub fn combine<I>(results: I) -> Option<Self>
    where
        I: IntoIterator<Item = RateLimitResult>,
    {
        results.into_iter().reduce(|acc, next| Self {
            success: acc.success && next.success,
            limit: acc.limit.min(next.limit),
            remaining: acc.remaining.min(next.remaining),
            reset: acc.reset.max(next.reset),
        })
    }
}
