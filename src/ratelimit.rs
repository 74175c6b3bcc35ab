/*!
 * Aggregate throughput throttling with a shared token bucket
 */

use crate::engine::CancelFlag;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Bucket granularity: 1000 tokens per second regardless of the configured
/// rate, so token counts stay inside u32 for arbitrarily large rates.
const TOKENS_PER_SEC: u32 = 1000;

/// Shared byte-rate limiter. Tokens represent bytes; workers acquire a
/// chunk's worth of tokens before starting its I/O and sleep cooperatively
/// while the bucket refills. Burst capacity is one chunk.
#[derive(Clone)]
pub struct RateLimiter {
    limiter: Option<Arc<GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>>>,
    bytes_per_token: u64,
    burst_tokens: u32,
}

impl RateLimiter {
    /// `limit` is the cap in bytes per second (`None` = unlimited);
    /// `burst_bytes` sizes the bucket, normally the base chunk size.
    pub fn new(limit: Option<u64>, burst_bytes: u64) -> Self {
        let Some(rate) = limit.filter(|r| *r > 0) else {
            return Self::unlimited();
        };

        let bytes_per_token = (rate / TOKENS_PER_SEC as u64).max(1);
        let burst_tokens = (burst_bytes / bytes_per_token).clamp(1, u32::MAX as u64) as u32;

        let quota = Quota::per_second(NonZeroU32::new(TOKENS_PER_SEC).unwrap())
            .allow_burst(NonZeroU32::new(burst_tokens).unwrap());

        Self {
            limiter: Some(Arc::new(GovernorRateLimiter::direct(quota))),
            bytes_per_token,
            burst_tokens,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            limiter: None,
            bytes_per_token: 0,
            burst_tokens: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    /// Block until `bytes` worth of tokens are available, or the transfer
    /// is cancelled. Returns false when interrupted by cancellation.
    pub fn acquire(&self, bytes: u64, cancel: &CancelFlag) -> bool {
        let Some(ref limiter) = self.limiter else {
            return true;
        };

        let mut remaining = (bytes / self.bytes_per_token).max(1);
        while remaining > 0 {
            if cancel.is_cancelled() {
                return false;
            }

            // Requests larger than the bucket are taken in bucket-sized
            // bites so check_n can never report insufficient capacity
            let ask = remaining.min(self.burst_tokens as u64) as u32;
            let tokens = NonZeroU32::new(ask).unwrap();

            match limiter.check_n(tokens) {
                Ok(Ok(())) => remaining -= ask as u64,
                _ => thread::sleep(Duration::from_millis(1)),
            }
        }
        true
    }
}
