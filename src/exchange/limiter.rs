//! Process-wide token-bucket rate limiter and retry backoff.

use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token bucket shared by every request a gateway makes. `acquire` suspends
/// the caller until a token is available; tokens refill continuously.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for refill if the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Exponential backoff for throttled queries: base 1 s, factor 2, cap 60 s,
/// jitter +/-20 %. `attempt` is zero-based.
pub fn backoff_delay(attempt: u32) -> Duration {
    let raw = (2_f64.powi(attempt as i32)).min(60.0);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_secs_f64(raw * jitter)
}

/// Retry budget for queries. Writes never consume this; a write is retried
/// only when the response proved the order was not accepted.
pub const MAX_QUERY_ATTEMPTS: u32 = 5;
