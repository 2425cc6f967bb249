//! Replication throttle — admission gate plus bandwidth meter.
//!
//! Every COPY/REPLACE/TRANSFER takes a `MovePermit` before moving bytes.
//! Acquisition never waits: a saturated node rejects the operation. The
//! permit is released when dropped, so every exit path releases it once.
//!
//! Bytes moved under a permit are metered against one node-wide token
//! bucket refilled at `bandwidth_per_sec`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Byte-denominated token bucket. The burst is one second of traffic.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec as f64;
        Self {
            tokens: rate,
            capacity: rate,
            refill_rate: rate,
            last_refill: Instant::now(),
        }
    }

    /// Take `bytes` from the bucket; returns how long the caller must wait
    /// before the debt is repaid.
    pub fn reserve(&mut self, bytes: usize) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_rate)
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens.min(self.capacity)
    }
}

/// Held for the duration of one block move.
#[derive(Debug)]
pub struct MovePermit {
    _permit: OwnedSemaphorePermit,
}

#[derive(Clone)]
pub struct BalanceThrottler {
    permits: Arc<Semaphore>,
    max_moves: usize,
    bandwidth: Option<Arc<Mutex<TokenBucket>>>,
}

impl BalanceThrottler {
    /// `bandwidth_per_sec` of 0 disables metering.
    pub fn new(max_moves: u32, bandwidth_per_sec: u64) -> Self {
        let max_moves = max_moves as usize;
        Self {
            permits: Arc::new(Semaphore::new(max_moves)),
            max_moves,
            bandwidth: (bandwidth_per_sec > 0)
                .then(|| Arc::new(Mutex::new(TokenBucket::new(bandwidth_per_sec)))),
        }
    }

    /// Admit one move, or None when `max_moves` are already running.
    pub fn try_acquire(&self) -> Option<MovePermit> {
        self.permits
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| MovePermit { _permit: permit })
    }

    /// Moves currently holding a permit.
    pub fn active(&self) -> usize {
        self.max_moves - self.permits.available_permits()
    }

    pub fn max_moves(&self) -> usize {
        self.max_moves
    }

    /// Meter `bytes` against the node bandwidth, sleeping if over budget.
    pub async fn throttle(&self, bytes: usize) {
        let Some(bucket) = &self.bandwidth else {
            return;
        };
        let wait = match bucket.lock() {
            Ok(mut b) => b.reserve(bytes),
            Err(poisoned) => poisoned.into_inner().reserve(bytes),
        };
        if !wait.is_zero() {
            tracing::trace!(bytes, wait_ms = wait.as_millis() as u64, "replication throttled");
            tokio::time::sleep(wait).await;
        }
    }
}
