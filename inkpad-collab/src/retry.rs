//! Bounded reconnect policy: exponential backoff with deterministic jitter.

use std::time::Duration;

/// Reconnect policy for a session.
///
/// Delays double per attempt up to `max_delay`; jitter spreads each delay
/// over `[d/2, d]` so sessions dropped by the same outage do not stampede
/// the server in lockstep. The jitter is a hash of `(seed, attempt)` rather
/// than a random draw, so a given session's schedule is reproducible.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first reconnect attempt
    pub initial_delay: Duration,
    /// Upper bound for the backoff delay
    pub max_delay: Duration,
    /// Attempts allowed per outage before the session reports `Failed`
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 6,
        }
    }
}

impl RetryPolicy {
    /// Whether the retry budget is spent after `attempt` failed attempts.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Delay to sleep before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, seed: u64) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let uncapped = self
            .initial_delay
            .saturating_mul(1u32.checked_shl(exp).unwrap_or(u32::MAX));
        let full = uncapped.min(self.max_delay);

        let half = full / 2;
        if half.is_zero() {
            return full;
        }
        let jitter_ns = splitmix64(seed ^ u64::from(attempt)) % (half.as_nanos() as u64 + 1);
        half + Duration::from_nanos(jitter_ns)
    }
}

/// SplitMix64 — cheap, well-distributed 64-bit mixer.
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
