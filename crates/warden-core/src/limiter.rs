use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Token bucket capping calls to the remote completion service.
///
/// Refill is computed lazily from elapsed time, so no background task is
/// needed. `try_acquire` never blocks; an empty bucket is a fast failure the
/// caller turns into a rate-limit outcome.
pub struct TokenBucket {
    capacity: u32,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket sized for `per_minute` calls, starting full.
    pub fn per_minute(per_minute: u32) -> Self {
        let per_minute = per_minute.max(1);
        Self {
            capacity: per_minute,
            refill_interval: Duration::from_secs_f64(60.0 / per_minute as f64),
            state: Mutex::new(BucketState {
                tokens: per_minute,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let elapsed = st.last_refill.elapsed();
        let minted = (elapsed.as_secs_f64() / self.refill_interval.as_secs_f64()) as u32;
        if minted > 0 {
            st.tokens = (st.tokens + minted).min(self.capacity);
            // Keep the remainder so partial intervals are not lost.
            st.last_refill += self.refill_interval * minted;
            if st.tokens == self.capacity {
                st.last_refill = Instant::now();
            }
        }

        if st.tokens > 0 {
            st.tokens -= 1;
            true
        } else {
            false
        }
    }
}
