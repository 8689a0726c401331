//! Leaky bucket admission primitive.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed.
    Admitted,
    /// Capacity is exhausted; `retry_after` is the time until the next drain.
    Denied { retry_after: Duration },
}

impl Admission {
    /// Whether this outcome lets the request through.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Mutable part of a bucket, guarded by the bucket's mutex.
#[derive(Debug)]
struct BucketState {
    /// Current fill level, `0..=capacity`
    level: u64,
    /// Start of the drain period currently in progress
    last_drain: Instant,
    /// When the bucket was last asked to admit anything
    last_seen: Instant,
}

/// A leaky bucket that fills by one per admitted request and drains
/// `drain_amount` units every `drain_period`.
///
/// A fresh bucket admits `capacity` requests at once; afterwards the
/// sustained rate is `drain_amount / drain_period`. Parameters are fixed at
/// construction. Each bucket has its own lock, so buckets never contend
/// with one another.
#[derive(Debug)]
pub struct LeakyBucket {
    capacity: u64,
    drain_amount: u64,
    drain_period: Duration,
    state: Mutex<BucketState>,
}

impl LeakyBucket {
    /// Create an empty bucket.
    ///
    /// All three parameters must be non-zero; configuration validation
    /// enforces this before any bucket is built.
    pub fn new(capacity: u64, drain_amount: u64, drain_period: Duration) -> Self {
        Self::new_at(capacity, drain_amount, drain_period, Instant::now())
    }

    /// Create an empty bucket whose drain clock starts at `now`.
    pub fn new_at(capacity: u64, drain_amount: u64, drain_period: Duration, now: Instant) -> Self {
        debug_assert!(capacity > 0, "bucket capacity must be non-zero");
        debug_assert!(drain_amount > 0, "bucket drain amount must be non-zero");
        debug_assert!(!drain_period.is_zero(), "bucket drain period must be non-zero");

        Self {
            capacity,
            drain_amount,
            drain_period,
            state: Mutex::new(BucketState {
                level: 0,
                last_drain: now,
                last_seen: now,
            }),
        }
    }

    /// Try to admit one request now.
    pub fn try_admit(&self) -> Admission {
        self.try_admit_at(Instant::now())
    }

    /// Try to admit one request at `now`.
    ///
    /// Drains first, then fills by one if there is room. A denial leaves the
    /// level untouched.
    pub fn try_admit_at(&self, now: Instant) -> Admission {
        let mut state = self.state.lock();
        self.drain(&mut state, now);
        state.last_seen = state.last_seen.max(now);

        if state.level < self.capacity {
            state.level += 1;
            debug_assert!(state.level <= self.capacity);
            Admission::Admitted
        } else {
            Admission::Denied {
                retry_after: self.until_next_drain(&state, now),
            }
        }
    }

    /// Current level, after draining up to now.
    pub fn level(&self) -> u64 {
        self.level_at(Instant::now())
    }

    /// Level at `now`, after draining.
    pub fn level_at(&self, now: Instant) -> u64 {
        let mut state = self.state.lock();
        self.drain(&mut state, now);
        state.level
    }

    /// Whether the bucket has fully drained by `now`.
    ///
    /// A drained bucket is indistinguishable from a fresh one, which is what
    /// makes it safe to evict.
    pub fn is_drained_at(&self, now: Instant) -> bool {
        self.level_at(now) == 0
    }

    /// When this bucket last saw an admission attempt.
    pub fn last_seen(&self) -> Instant {
        self.state.lock().last_seen
    }

    /// Get the burst capacity.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Get the units drained per period.
    pub fn drain_amount(&self) -> u64 {
        self.drain_amount
    }

    /// Get the drain period.
    pub fn drain_period(&self) -> Duration {
        self.drain_period
    }

    /// Apply every whole drain period elapsed since `last_drain`.
    ///
    /// The clock only advances by whole periods so that partial progress
    /// toward the next drain is kept.
    fn drain(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_drain);
        let period_nanos = self.drain_period.as_nanos();
        let periods = elapsed.as_nanos() / period_nanos;
        if periods == 0 {
            return;
        }

        let drained = periods.saturating_mul(self.drain_amount as u128);
        state.level = state.level.saturating_sub(u64::try_from(drained).unwrap_or(u64::MAX));
        state.last_drain += nanos_to_duration(periods * period_nanos);
    }

    fn until_next_drain(&self, state: &BucketState, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(state.last_drain);
        self.drain_period.saturating_sub(elapsed)
    }
}

fn nanos_to_duration(nanos: u128) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_fresh_bucket_admits_full_burst() {
        let start = Instant::now();
        let bucket = LeakyBucket::new_at(5, 1, SECOND, start);

        for _ in 0..5 {
            assert!(bucket.try_admit_at(start).is_admitted());
        }

        // The 6th request should be rejected
        assert!(!bucket.try_admit_at(start).is_admitted());
        assert_eq!(bucket.level_at(start), 5);
    }

    #[test]
    fn test_denial_does_not_change_level() {
        let start = Instant::now();
        let bucket = LeakyBucket::new_at(2, 1, SECOND, start);
        bucket.try_admit_at(start);
        bucket.try_admit_at(start);

        for _ in 0..10 {
            assert!(!bucket.try_admit_at(start).is_admitted());
        }
        assert_eq!(bucket.level_at(start), 2);

        // One period later exactly one slot has drained, regardless of the
        // denials above.
        let later = start + SECOND;
        assert!(bucket.try_admit_at(later).is_admitted());
        assert!(!bucket.try_admit_at(later).is_admitted());
    }

    #[test]
    fn test_drain_recovers_after_one_period() {
        let start = Instant::now();
        let bucket = LeakyBucket::new_at(50, 8, SECOND, start);

        for _ in 0..50 {
            assert!(bucket.try_admit_at(start).is_admitted());
        }
        assert!(!bucket.try_admit_at(start).is_admitted());

        let later = start + SECOND;
        for _ in 0..8 {
            assert!(bucket.try_admit_at(later).is_admitted());
        }
        assert!(!bucket.try_admit_at(later).is_admitted());
    }

    #[test]
    fn test_partial_period_does_not_drain() {
        let start = Instant::now();
        let bucket = LeakyBucket::new_at(1, 1, SECOND, start);
        assert!(bucket.try_admit_at(start).is_admitted());

        assert!(!bucket.try_admit_at(start + Duration::from_millis(999)).is_admitted());
        assert!(bucket.try_admit_at(start + SECOND).is_admitted());
    }

    #[test]
    fn test_fractional_progress_is_kept() {
        let start = Instant::now();
        let bucket = LeakyBucket::new_at(2, 1, SECOND, start);
        bucket.try_admit_at(start);
        bucket.try_admit_at(start);

        // 1.5 periods: one drain, half a period carried forward.
        let t1 = start + Duration::from_millis(1_500);
        assert!(bucket.try_admit_at(t1).is_admitted());
        assert!(!bucket.try_admit_at(t1).is_admitted());

        // Another half period completes the second drain. Resetting the clock
        // to t1 would have required waiting a full second here.
        let t2 = start + Duration::from_millis(2_000);
        assert!(bucket.try_admit_at(t2).is_admitted());
    }

    #[test]
    fn test_level_floors_at_zero() {
        let start = Instant::now();
        let bucket = LeakyBucket::new_at(10, 8, SECOND, start);
        bucket.try_admit_at(start);

        assert_eq!(bucket.level_at(start + Duration::from_secs(3600)), 0);
        assert!(bucket.is_drained_at(start + Duration::from_secs(3600)));
    }

    #[test]
    fn test_sustained_rate_bound() {
        let start = Instant::now();
        let capacity = 10;
        let drain_amount = 3;
        let period = Duration::from_millis(100);
        let bucket = LeakyBucket::new_at(capacity, drain_amount, period, start);

        // Drive requests every millisecond for 5 seconds.
        let window = Duration::from_secs(5);
        let mut admitted = 0u64;
        let mut now = start;
        while now < start + window {
            for _ in 0..4 {
                if bucket.try_admit_at(now).is_admitted() {
                    admitted += 1;
                }
            }
            now += Duration::from_millis(1);
        }

        let periods = (window.as_millis() / period.as_millis()) as u64;
        assert!(admitted <= capacity + periods * drain_amount);
        // Driven flat out, the bound should be reached up to the last period.
        assert!(admitted >= capacity + (periods - 1) * drain_amount);
    }

    #[test]
    fn test_retry_after_points_to_next_drain() {
        let start = Instant::now();
        let bucket = LeakyBucket::new_at(1, 1, SECOND, start);
        bucket.try_admit_at(start);

        match bucket.try_admit_at(start + Duration::from_millis(300)) {
            Admission::Denied { retry_after } => {
                assert_eq!(retry_after, Duration::from_millis(700));
            }
            Admission::Admitted => panic!("bucket should be full"),
        }
    }

    #[test]
    fn test_last_seen_tracks_attempts() {
        let start = Instant::now();
        let bucket = LeakyBucket::new_at(1, 1, SECOND, start);
        let later = start + Duration::from_secs(2);

        bucket.try_admit_at(later);
        assert_eq!(bucket.last_seen(), later);
    }

    #[test]
    fn test_long_idle_does_not_overflow() {
        let start = Instant::now();
        let bucket = LeakyBucket::new_at(u64::MAX, u64::MAX, Duration::from_nanos(1), start);
        bucket.try_admit_at(start);

        assert!(bucket.try_admit_at(start + Duration::from_secs(86_400 * 365)).is_admitted());
    }
}
