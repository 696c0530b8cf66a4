//! Sliding-window rate limiter for calls to the external provider.
//!
//! Unlike the budget cap, the limiter never rejects: `acquire` parks the
//! caller until a slot frees up, so burst load is throttled rather than
//! dropped or failed.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_per_window: u32,
    window: Duration,
    // Timestamps of calls admitted within the current window.
    admitted: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            admitted: Mutex::new(VecDeque::new()),
        }
    }

    /// Convenience constructor: `max` calls per second.
    pub fn per_second(max: u32) -> Self {
        Self::new(max, Duration::from_secs(1))
    }

    /// No limiting; every acquire returns immediately.
    pub fn unlimited() -> Self {
        Self::new(0, Duration::from_secs(1))
    }

    /// Wait until a slot is available, then claim it. Returns the total
    /// time spent throttled (zero when a slot was free).
    pub async fn acquire(&self) -> Duration {
        if self.max_per_window == 0 {
            return Duration::ZERO;
        }

        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut admitted = self.admitted.lock().await;
                let now = Instant::now();
                while let Some(front) = admitted.front() {
                    if now.duration_since(*front) >= self.window {
                        admitted.pop_front();
                    } else {
                        break;
                    }
                }

                if (admitted.len() as u32) < self.max_per_window {
                    admitted.push_back(now);
                    return waited;
                }

                // Oldest admitted call decides when the next slot opens.
                let front = *admitted.front().expect("non-empty at capacity");
                self.window - now.duration_since(front)
            };

            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_throttled_not_dropped() {
        let limiter = Arc::new(SlidingWindowLimiter::new(2, Duration::from_millis(100)));
        let start = Instant::now();

        // 6 acquires at 2 per 100ms: slots at 0, 0, 100, 100, 200, 200.
        for _ in 0..6 {
            limiter.acquire().await;
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_slot_does_not_wait() {
        let limiter = SlidingWindowLimiter::per_second(10);
        assert_eq!(limiter.acquire().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_frees_slots() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_millis(50));
        limiter.acquire().await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(limiter.acquire().await, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquires_all_complete() {
        let limiter = Arc::new(SlidingWindowLimiter::new(3, Duration::from_millis(100)));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();

        let mut throttled = 0;
        for handle in handles {
            if handle.await.unwrap() > Duration::ZERO {
                throttled += 1;
            }
        }
        // 3 slots are free; the other 9 must have waited.
        assert_eq!(throttled, 9);
    }

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = SlidingWindowLimiter::unlimited();
        for _ in 0..100 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }
    }
}
