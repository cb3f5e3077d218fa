//! Per-provider token bucket (RPS) plus bounded semaphore (max concurrent) (§4.4).
//!
//! `acquire` atomically waits for both a refill token and a semaphore slot; queue-wait
//! is measured from call to return and reported in `provider_meta.queue_wait_ms`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::errors::GatewayError;

struct RateBucket {
    tokens: f64,
    last_refill: Instant,
    rps: f64,
    burst: f64,
}

impl RateBucket {
    fn new(rps: f64, burst: f64) -> Self {
        Self { tokens: burst, last_refill: Instant::now(), rps, burst }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rps).min(self.burst);
        self.last_refill = Instant::now();
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_next_token(&self) -> Duration {
        if self.rps <= 0.0 {
            return Duration::from_secs(u64::MAX / 2);
        }
        let needed = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(needed / self.rps)
    }
}

/// A held admission slot. Dropping it releases the semaphore permit automatically;
/// `release` exists for callers that want the release to be explicit/traceable.
pub struct Permit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Per-provider rate limiter: token bucket for RPS, semaphore for concurrency.
pub struct ProviderPacer {
    bucket: Mutex<RateBucket>,
    semaphore: Arc<Semaphore>,
}

impl ProviderPacer {
    /// Build a pacer with the given RPS, burst capacity, and max concurrency.
    #[must_use]
    pub fn new(rps: f64, burst: f64, concurrency: usize) -> Self {
        Self {
            bucket: Mutex::new(RateBucket::new(rps, burst)),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Wait for both a refill token and a semaphore slot, or time out at `deadline`.
    /// Returns `(Permit, queue_wait)`.
    pub async fn acquire(&self, deadline: Duration) -> Result<(Permit, Duration), GatewayError> {
        let started = Instant::now();
        let permit = tokio::time::timeout(deadline, Arc::clone(&self.semaphore).acquire_owned())
            .await
            .map_err(|_| GatewayError::Timeout("pacer semaphore wait exceeded deadline".into()))?
            .map_err(|_| GatewayError::UpstreamFatal("pacer semaphore closed".into()))?;

        loop {
            {
                let mut bucket = self.bucket.lock().await;
                if bucket.try_take() {
                    return Ok((Permit { _permit: permit }, started.elapsed()));
                }
                if started.elapsed() >= deadline {
                    return Err(GatewayError::RateLimited {
                        message: "pacer token-bucket wait exceeded deadline".into(),
                        retry_after_ms: Some(bucket.time_until_next_token().as_millis() as u64),
                    });
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// The release step is implicit via `Drop`; exposed as a no-op function so call sites
/// can document the release point the way §4.4 describes the contract.
pub fn release(_permit: Permit) {}

/// Registry of per-provider pacers, built from `per_provider.*` config (§6.4).
#[derive(Default)]
pub struct PacerRegistry {
    pacers: HashMap<String, Arc<ProviderPacer>>,
}

impl PacerRegistry {
    /// Build an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the pacer for `provider`.
    pub fn insert(&mut self, provider: impl Into<String>, rps: f64, burst: f64, concurrency: usize) {
        self.pacers.insert(provider.into(), Arc::new(ProviderPacer::new(rps, burst, concurrency)));
    }

    /// Fetch the pacer for `provider`, if configured.
    #[must_use]
    pub fn get(&self, provider: &str) -> Option<Arc<ProviderPacer>> {
        self.pacers.get(provider).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_acquire_has_near_zero_queue_wait() {
        let pacer = ProviderPacer::new(1.0, 1.0, 1);
        let (_permit, wait) = pacer.acquire(Duration::from_secs(1)).await.unwrap();
        assert!(wait < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn exhausted_bucket_queues_for_roughly_one_second_at_rps_one() {
        let pacer = ProviderPacer::new(1.0, 1.0, 5);
        let (p1, _) = pacer.acquire(Duration::from_secs(5)).await.unwrap();
        release(p1);
        let (p2, wait) = pacer.acquire(Duration::from_secs(5)).await.unwrap();
        release(p2);
        assert!(wait >= Duration::from_millis(900));
        assert!(wait <= Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn semaphore_caps_concurrency() {
        let pacer = Arc::new(ProviderPacer::new(1000.0, 1000.0, 1));
        let (permit, _) = pacer.acquire(Duration::from_millis(100)).await.unwrap();
        let result = pacer.acquire(Duration::from_millis(50)).await;
        assert!(result.is_err());
        drop(permit);
        let result = pacer.acquire(Duration::from_millis(100)).await;
        assert!(result.is_ok());
    }
}
