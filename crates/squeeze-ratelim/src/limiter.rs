//! The process-wide bandwidth limiter shared by every throttled stream.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::bucket::TokenBucket;

/// Smallest burst [`good_burst`] will pick, in bytes.
pub const MIN_BURST: u64 = 1;

/// Largest burst [`good_burst`] will pick, in bytes.
pub const MAX_BURST: u64 = 64 * 1024;

/// Choose a burst size that limits `rate` (bytes/second) precisely without
/// paying bucket overhead on every few bytes.
///
/// We aim for roughly 20 reservations per second of sustained traffic, so
/// the limiter tracks the target rate to within about 5%. The result is
/// always in `[MIN_BURST, MAX_BURST]`.
///
/// A rate of 0 means "unlimited" and maps to [`MAX_BURST`]: a zero burst
/// would instead make every reservation fail.
pub fn good_burst(rate: u64) -> u64 {
    if rate == 0 {
        return MAX_BURST;
    }
    (rate / 20).clamp(MIN_BURST, MAX_BURST)
}

/// An aggregate bandwidth limit, expressed as a shared token bucket.
///
/// One `Limiter` is typically constructed per process and handed by
/// [`Arc`](std::sync::Arc) to every [`LimitedStream`](crate::LimitedStream);
/// all of them then draw bytes from the same budget, enforcing a single
/// ceiling on their combined throughput.
///
/// Reservations are linearized by an internal mutex: each call observes the
/// cumulative effect of all earlier calls. No fairness is promised across
/// competing streams beyond what the mutex provides.
#[derive(Debug)]
pub struct Limiter {
    /// The configured rate in bytes/second. 0 means unlimited.
    rate: u64,
    /// Bucket capacity, chosen once by [`good_burst`].
    burst: u64,
    /// The shared bucket.
    bucket: Mutex<TokenBucket<Instant>>,
}

impl Limiter {
    /// A new limiter enforcing `bytes_per_sec` across every stream that
    /// shares it. A rate of 0 disables throttling entirely.
    pub fn new(bytes_per_sec: u64) -> Self {
        let burst = good_burst(bytes_per_sec);
        Self {
            rate: bytes_per_sec,
            burst,
            bucket: Mutex::new(TokenBucket::new(bytes_per_sec, burst, Instant::now())),
        }
    }

    /// The burst capacity: the largest chunk a stream should transfer per
    /// operation.
    pub fn burst(&self) -> u64 {
        self.burst
    }

    /// The configured rate in bytes/second. 0 means unlimited.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Reserve `n` tokens as of `now`, and return how long the caller must
    /// wait from `now` before the reservation is earned.
    ///
    /// The tokens are consumed unconditionally, going into debt if the
    /// bucket cannot cover them; `Duration::ZERO` means they were already
    /// available. An unlimited (zero-rate) limiter always returns
    /// `Duration::ZERO`.
    pub fn reserve(&self, now: Instant, n: u64) -> Duration {
        if self.rate == 0 || n == 0 {
            return Duration::ZERO;
        }
        let mut bucket = self.bucket.lock().expect("poisoned lock");
        bucket.refill(now);
        bucket
            .reserve(n)
            // `None` needs a debt many years long; treat it as ready.
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now))
    }
}
