//! A token bucket that supports reservations.
//!
//! Calculations are performed at microsecond resolution, and refills are
//! drift-free: when a refill happens at a time that is not exactly in period
//! with the refill rate, the fractional token is not rounded away but left
//! for the next refill to collect.

use std::fmt::Debug;
use std::time::Duration;

/// A token bucket whose level may go negative.
///
/// Unlike a classic bucket that refuses a request it cannot satisfy, this
/// bucket lets [`reserve`](Self::reserve) take the level into debt and
/// reports the instant at which the consumed tokens will have been earned.
/// Callers are expected to delay their next operation until that instant.
///
/// The bucket is not synchronized; [`Limiter`](crate::Limiter) wraps it in a
/// mutex and is the only user.
#[derive(Debug)]
pub(crate) struct TokenBucket<I> {
    /// The refill rate in tokens/second.
    ///
    /// A rate of 0 never refills; the limiter treats that case as
    /// "unlimited" and bypasses the bucket entirely.
    rate: u64,
    /// The maximum number of tokens the bucket can hold ("burst").
    bucket_max: u64,
    /// Current level. Negative values are outstanding reservation debt.
    level: i64,
    /// Time at which the most recent whole token was added to the bucket.
    ///
    /// This is deliberately not "the last time `refill` ran": if the bucket
    /// earns one token every 100 ms and is refilled at 510 ms, it gains five
    /// tokens and this field is set to 500 ms, so the sixth token is still
    /// due at 600 ms.
    last_refill: I,
}

impl<I: BucketInstant> TokenBucket<I> {
    /// A new bucket with the given `rate` in tokens/second and `max`
    /// capacity, initially full.
    pub(crate) fn new(rate: u64, max: u64, now: I) -> Self {
        Self {
            rate,
            bucket_max: max,
            level: clamp_to_i64(max),
            last_refill: now,
        }
    }

    /// Add the tokens earned since the last refill.
    ///
    /// The level never exceeds `bucket_max`, and never decreases.
    pub(crate) fn refill(&mut self, now: I) {
        let elapsed = now.saturating_duration_since(self.last_refill);

        // A jump this large means a broken monotonic clock (this has
        // historically happened on some platforms). Resynchronize without
        // crediting any tokens.
        if elapsed > I::IGNORE_THRESHOLD {
            tracing::debug!(
                "ignoring a time jump of {elapsed:?} while refilling the token bucket",
            );
            self.last_refill = now;
            return;
        }

        let earned = duration_to_tokens(elapsed, self.rate);
        self.level = self
            .level
            .saturating_add(clamp_to_i64(earned))
            .min(clamp_to_i64(self.bucket_max));

        // Advance the refill time by the whole tokens actually earned, not
        // by `elapsed`, so that fractional tokens are never lost to
        // rounding. `earned` was derived from `elapsed`, so this cannot
        // move `last_refill` past `now`.
        let step = tokens_to_duration(earned, self.rate).unwrap_or(Duration::ZERO);
        if let Some(at) = self.last_refill.checked_add(step) {
            self.last_refill = at;
        }
    }

    /// Consume `n` tokens, going into debt if the level is insufficient.
    ///
    /// Returns the instant at which all consumed tokens will have been
    /// earned; an instant in the past means they were already available.
    /// Callers must [`refill`](Self::refill) first, and must not call this
    /// on a zero-rate bucket (the debt could then never be repaid).
    ///
    /// `None` is returned only if the repayment instant cannot be
    /// represented, which requires a debt many years long.
    pub(crate) fn reserve(&mut self, n: u64) -> Option<I> {
        debug_assert!(self.rate != 0);
        self.level = self.level.saturating_sub(clamp_to_i64(n));
        if self.level >= 0 {
            return Some(self.last_refill);
        }
        let debt = self.level.unsigned_abs();
        let owed = tokens_to_duration(debt, self.rate)?;
        self.last_refill.checked_add(owed)
    }
}

/// Clamp a `u64` token count into the signed domain used by the level.
fn clamp_to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// How long does it take to earn `tokens` at `rate` tokens/second?
///
/// Rounded up to the nearest microsecond; `None` if the rate is 0. For
/// astronomically large token counts the saturating arithmetic can
/// underestimate the result.
fn tokens_to_duration(tokens: u64, rate: u64) -> Option<Duration> {
    if rate == 0 {
        return None;
    }
    // (tokens) * (microseconds/second) / (tokens/second) = microseconds
    let micros = tokens.saturating_mul(1_000_000).div_ceil(rate);
    Some(Duration::from_micros(micros))
}

/// How many whole tokens are earned within `elapsed` at `rate` tokens/second?
///
/// Truncates to microsecond granularity.
fn duration_to_tokens(elapsed: Duration, rate: u64) -> u64 {
    let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
    // (tokens/second) * (microseconds) / (microseconds/second) = tokens
    rate.saturating_mul(micros) / 1_000_000
}

/// A measurement of a monotonically nondecreasing clock.
///
/// The bucket is generic over its notion of time so that unit tests can use
/// a plain counter instead of a real clock.
pub(crate) trait BucketInstant: Copy + Debug + PartialOrd {
    /// An unrealistically large time jump.
    ///
    /// Elapsed times above this are treated as clock breakage and ignored
    /// by [`TokenBucket::refill`].
    const IGNORE_THRESHOLD: Duration;

    /// See [`std::time::Instant::checked_add`].
    fn checked_add(&self, duration: Duration) -> Option<Self>;

    /// See [`std::time::Instant::checked_duration_since`].
    fn checked_duration_since(&self, earlier: Self) -> Option<Duration>;

    /// See [`std::time::Instant::saturating_duration_since`].
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        self.checked_duration_since(earlier).unwrap_or_default()
    }
}

impl BucketInstant for tokio::time::Instant {
    // ~34 years. Monotonic clocks have historically produced jumps like
    // this on platforms with wrapping timers.
    const IGNORE_THRESHOLD: Duration = Duration::from_secs(1 << 30);

    #[inline]
    fn checked_add(&self, duration: Duration) -> Option<Self> {
        tokio::time::Instant::checked_add(self, duration)
    }

    #[inline]
    fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        tokio::time::Instant::checked_duration_since(self, earlier)
    }

    #[inline]
    fn saturating_duration_since(&self, earlier: Self) -> Duration {
        tokio::time::Instant::saturating_duration_since(self, earlier)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]

    use super::*;

    /// A fake clock: milliseconds since an arbitrary origin.
    #[derive(Copy, Clone, Debug, PartialEq, PartialOrd)]
    struct Millis(u64);

    impl BucketInstant for Millis {
        const IGNORE_THRESHOLD: Duration = Duration::from_millis(1_000_000_000);

        fn checked_add(&self, duration: Duration) -> Option<Self> {
            let duration = u64::try_from(duration.as_millis()).ok()?;
            self.0.checked_add(duration).map(Self)
        }

        fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
            Some(Duration::from_millis(self.0.checked_sub(earlier.0)?))
        }
    }

    #[test]
    fn starts_full() {
        let tb = TokenBucket::new(10, 100, Millis(0));
        assert_eq!(tb.level, 100);
        assert_eq!(tb.bucket_max, 100);
    }

    #[test]
    fn refill_is_capped_and_monotonic() {
        // one token every 100 ms
        let mut tb = TokenBucket::new(10, 100, Millis(100));

        assert_eq!(tb.reserve(50), Some(Millis(100)));
        assert_eq!(tb.level, 50);

        tb.refill(Millis(1100));
        assert_eq!(tb.level, 60);

        // a very long idle period refills to the cap, no further
        tb.refill(Millis(1_000_000));
        assert_eq!(tb.level, 100);
        tb.refill(Millis(2_000_000));
        assert_eq!(tb.level, 100);
    }

    #[test]
    fn refill_does_not_drift() {
        // one token every 100 ms, drained empty at t=0
        let mut tb = TokenBucket::new(10, 100, Millis(0));
        tb.reserve(100).unwrap();
        assert_eq!(tb.level, 0);

        // Refilling at 150 ms must credit the 100 ms token without moving
        // the schedule: the next token is still due at 200 ms, not 250 ms.
        tb.refill(Millis(99));
        assert_eq!(tb.level, 0);
        tb.refill(Millis(150));
        assert_eq!(tb.level, 1);
        tb.refill(Millis(199));
        assert_eq!(tb.level, 1);
        tb.refill(Millis(200));
        assert_eq!(tb.level, 2);
    }

    #[test]
    fn reserve_goes_into_debt() {
        // one token every 10 ms
        let mut tb = TokenBucket::new(100, 50, Millis(0));

        // 50 available now; 30 more owed, earned at 300 ms.
        let at = tb.reserve(80).unwrap();
        assert_eq!(at, Millis(300));
        assert_eq!(tb.level, -30);

        // Another reservation queues behind the first debt.
        let at = tb.reserve(10).unwrap();
        assert_eq!(at, Millis(400));

        // Refilling repays debt before the level goes positive.
        tb.refill(Millis(350));
        assert_eq!(tb.level, -5);
        tb.refill(Millis(500));
        assert_eq!(tb.level, 10);
    }

    #[test]
    fn huge_time_jump_is_ignored() {
        let mut tb = TokenBucket::new(10, 100, Millis(0));
        tb.reserve(100).unwrap();

        tb.refill(Millis(2_000_000_000));
        assert_eq!(tb.level, 0);
        assert_eq!(tb.last_refill, Millis(2_000_000_000));

        // and the clock is resynchronized afterwards
        tb.refill(Millis(2_000_000_100));
        assert_eq!(tb.level, 1);
    }

    #[test]
    fn conversion_round_trip() {
        for rate in [1, 3, 7, 1000, 1_000_000, u64::MAX] {
            for elapsed in [
                Duration::ZERO,
                Duration::from_micros(1),
                Duration::from_millis(123),
                Duration::from_secs(5),
            ] {
                // After the initial truncation, converting tokens to a
                // duration and back must be lossless, or the bucket would
                // slowly fall behind its configured rate.
                let tokens = duration_to_tokens(elapsed, rate);
                let d = tokens_to_duration(tokens, rate).unwrap();
                assert_eq!(tokens, duration_to_tokens(d, rate));
            }
        }
        assert_eq!(tokens_to_duration(1, 0), None);
        assert_eq!(duration_to_tokens(Duration::from_secs(10), 0), 0);
    }
}
