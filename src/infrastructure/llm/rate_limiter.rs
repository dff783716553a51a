/// Token bucket rate limiter for provider requests
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

/// Token bucket rate limiter.
///
/// Tokens refill continuously at `refill_rate` per second up to `capacity`;
/// `acquire` waits until one token is available, then consumes it.
pub struct TokenBucketRateLimiter {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_rate: f64,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucketRateLimiter {
    pub fn new(requests_per_second: f64) -> Self {
        assert!(requests_per_second > 0.0, "requests_per_second must be positive");
        Self {
            state: Mutex::new(BucketState {
                tokens: requests_per_second,
                last_refill: Instant::now(),
            }),
            capacity: requests_per_second,
            refill_rate: requests_per_second,
        }
    }

    /// Wait until a token is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
                state.last_refill = Instant::now();

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate))
                }
            };

            match wait {
                None => return,
                Some(duration) => sleep(duration).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_up_to_capacity_is_immediate() {
        let limiter = TokenBucketRateLimiter::new(5.0);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn exceeding_capacity_waits() {
        let limiter = TokenBucketRateLimiter::new(2.0);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        // The third token needs ~0.5s of refill.
        assert!(start.elapsed() >= Duration::from_millis(400));
    }
}
