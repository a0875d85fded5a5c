//! Shared outbound request pacing.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Hands out evenly spaced send slots so aggregate throughput never exceeds
/// the configured queries-per-second ceiling, however many callers share it.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Pacer {
    /// Builds a pacer for `qps` requests per second. `qps` must be positive.
    pub fn new(qps: f64) -> Self {
        let interval = if qps.is_finite() && qps > 0.0 {
            Duration::from_secs_f64(1.0 / qps)
        } else {
            Duration::ZERO
        };
        Self::with_interval(interval)
    }

    /// Builds a pacer with an explicit spacing between requests.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Minimum spacing between two admitted requests.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits until the caller may send. The first caller is admitted at once.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot
        };
        sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn sequential_calls_are_spaced() {
        let pacer = Pacer::new(4.0);
        let start = Instant::now();
        for _ in 0..5 {
            pacer.acquire().await;
        }
        // five slots at 250ms spacing: 0, 250, 500, 750, 1000
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(start.elapsed() < Duration::from_millis(1250));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn concurrent_callers_share_the_ceiling() {
        let pacer = Arc::new(Pacer::new(10.0));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let pacer = Arc::clone(&pacer);
            handles.push(tokio::spawn(async move { pacer.acquire().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn idle_gap_does_not_bank_credit() {
        let pacer = Pacer::new(2.0);
        pacer.acquire().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let start = Instant::now();
        pacer.acquire().await;
        pacer.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
