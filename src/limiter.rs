//! Global throughput cap shared by all chunk writers.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use tracing::info;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Largest burst admitted at once. Keeps the overshoot over any window to
/// about one read buffer.
pub const MAX_BURST_BYTES: u32 = 64 * 1024;

struct Gate {
    rate: NonZeroU32,
    burst: NonZeroU32,
    limiter: Arc<DirectLimiter>,
}

/// Token bucket over bytes. The rate can be changed at runtime; the change is
/// seen by every caller from its next admission on.
pub struct SpeedLimiter {
    gate: RwLock<Option<Arc<Gate>>>,
}

impl SpeedLimiter {
    /// `None` or zero means unlimited.
    pub fn new(bytes_per_second: Option<u32>) -> Self {
        Self {
            gate: RwLock::new(bytes_per_second.and_then(Self::gate_for)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn rate(&self) -> Option<u32> {
        self.gate.read().as_ref().map(|g| g.rate.get())
    }

    /// Change the permitted rate.
    pub fn set_rate(&self, bytes_per_second: Option<u32>) {
        let gate = bytes_per_second.and_then(Self::gate_for);
        info!(rate = ?bytes_per_second, "speed limit changed");
        *self.gate.write() = gate;
    }

    /// Suspend until `bytes` may be written.
    pub async fn request_permission(&self, bytes: usize) {
        let mut remaining = bytes as u64;
        while remaining > 0 {
            // Re-read the gate per piece so rate changes apply mid-request.
            let Some(gate) = self.gate.read().clone() else {
                return;
            };
            let piece = remaining.min(u64::from(gate.burst.get())) as u32;
            if let Some(n) = NonZeroU32::new(piece) {
                // `piece <= burst`, so capacity is always sufficient.
                let _ = gate.limiter.until_n_ready(n).await;
            }
            remaining -= u64::from(piece);
        }
    }

    fn gate_for(rate: u32) -> Option<Arc<Gate>> {
        let rate = NonZeroU32::new(rate)?;
        let burst = NonZeroU32::new(rate.get().min(MAX_BURST_BYTES))?;
        let quota = Quota::per_second(rate).allow_burst(burst);
        Some(Arc::new(Gate {
            rate,
            burst,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }))
    }
}

impl Default for SpeedLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_unlimited_admits_immediately() {
        let limiter = SpeedLimiter::unlimited();
        let start = Instant::now();
        limiter.request_permission(100 * 1024 * 1024).await;
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(limiter.rate(), None);
        assert_eq!(SpeedLimiter::new(Some(0)).rate(), None);
    }

    #[tokio::test]
    async fn test_throughput_bounded_by_rate() {
        let rate = 512 * 1024;
        let limiter = SpeedLimiter::new(Some(rate));
        let start = Instant::now();
        // 8 buffers of 64 KiB beyond the initial burst: at least ~0.875 s.
        for _ in 0..8 {
            limiter.request_permission(64 * 1024).await;
        }
        let elapsed = start.elapsed().as_secs_f64();
        let admitted = (8 * 64 * 1024) as f64;
        assert!(admitted <= rate as f64 * elapsed + MAX_BURST_BYTES as f64 + 1.0);
    }

    #[tokio::test]
    async fn test_rate_change_applies_to_next_request() {
        let limiter = Arc::new(SpeedLimiter::new(Some(1024)));
        assert_eq!(limiter.rate(), Some(1024));
        limiter.set_rate(None);
        let start = Instant::now();
        limiter.request_permission(10 * 1024 * 1024).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
