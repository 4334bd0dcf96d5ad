//! Backoff strategies for retrying failed jobs and restarting the worker process.
//!
//! Two strategies are provided, constant and exponential, each of which can be modified by
//! applying jitter and clamped with a minimum and a maximum. The clamps are applied after the
//! jitter, so the maximum is a hard ceiling.
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use taskloom::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1))
//!     .with_jitter(Jitter::Relative(0.25))
//!     .with_max(TimeDelta::seconds(30));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::milliseconds(750));
//! assert!(strategy.backoff(1) <= TimeDelta::milliseconds(1250));
//! assert!(strategy.backoff(3) >= TimeDelta::seconds(3));
//! assert!(strategy.backoff(3) <= TimeDelta::seconds(5));
//! assert!(strategy.backoff(10) <= TimeDelta::seconds(30));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given an attempt number (starting from 1) returns the [`TimeDelta`] to wait before the
    /// next attempt.
    fn backoff(&self, attempt: u32) -> TimeDelta;
}

/// Constant backoff strategy.
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::constant`]
/// should be used.
///
/// ```
/// # use taskloom::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = BackoffStrategy::constant(TimeDelta::seconds(2));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
/// assert_eq!(strategy.backoff(5), TimeDelta::seconds(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u32) -> TimeDelta {
        self.delay
    }
}

/// Exponential backoff strategy, doubling with each attempt: `base * 2^(attempt - 1)`.
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::exponential`]
/// should be used.
///
/// ```
/// # use taskloom::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy =
///     BackoffStrategy::exponential(TimeDelta::seconds(1)).with_max(TimeDelta::seconds(30));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(1));
/// assert_eq!(strategy.backoff(2), TimeDelta::seconds(2));
/// assert_eq!(strategy.backoff(3), TimeDelta::seconds(4));
/// assert_eq!(strategy.backoff(5), TimeDelta::seconds(16));
/// assert_eq!(strategy.backoff(6), TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let factor = 2_i32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(i32::MAX);
        self.base.checked_mul(factor).unwrap_or(TimeDelta::MAX)
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the backoff in the range `-delta <= jitter <= delta`.
    Absolute(TimeDelta),
    /// Scales the backoff by a random factor in the range `1 - ratio ..= 1 + ratio`.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta, rng: &mut impl Rng) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        }
        .saturating_abs();
        let jitter = rng.gen_range(-milliseconds..=milliseconds);
        TimeDelta::try_milliseconds(jitter)
            .and_then(|delta| value.checked_add(&delta))
            .unwrap_or(if jitter < 0 {
                TimeDelta::MIN
            } else {
                TimeDelta::MAX
            })
    }
}

/// A configurable backoff strategy.
///
/// Constructed via [`BackoffStrategy::constant`] or [`BackoffStrategy::exponential`], then
/// optionally given a [`Jitter`], a minimum, and a maximum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
    max: Option<TimeDelta>,
}

impl BackoffStrategy<Constant> {
    /// Creates a [`BackoffStrategy`] returning the same delay for every attempt.
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] doubling from `base` with each attempt.
    ///
    /// It is advisable to set the maximum backoff using [`BackoffStrategy::with_max`].
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base })
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Creates a [`BackoffStrategy`] from a custom [`Strategy`].
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
            max: None,
        }
    }

    /// Add a jitter to the backoff strategy, see [`Jitter`].
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// The smallest delay ever returned, useful with a large absolute jitter.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }

    /// The largest delay ever returned, applied after the jitter.
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.max = Some(max);
        self
    }

    /// Computes the backoff using the given source of randomness for the jitter.
    pub fn backoff_with_rng(&self, attempt: u32, rng: &mut impl Rng) -> TimeDelta {
        let mut backoff = self.strategy.backoff(attempt);

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff, rng);
        }

        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }

        backoff.max(self.min)
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u32) -> TimeDelta {
        self.backoff_with_rng(attempt, &mut rand::thread_rng())
    }
}

/// The strategy used to delay the retry of a failed job.
pub type RetryPolicy = BackoffStrategy<Exponential>;

/// Base delay of the default [`RetryPolicy`].
pub const DEFAULT_RETRY_BASE: TimeDelta = TimeDelta::seconds(1);
/// Maximum delay of the default [`RetryPolicy`].
pub const DEFAULT_RETRY_MAX: TimeDelta = TimeDelta::seconds(30);
/// Jitter ratio of the default [`RetryPolicy`], spreading retries of jobs that failed together.
pub const DEFAULT_RETRY_JITTER: f64 = 0.25;

/// The default retry policy:
///  - exponential backoff starting at 1 second,
///  - with a 25% jitter margin,
///  - capped at 30 seconds.
pub const DEFAULT_RETRY_POLICY: RetryPolicy = retry_policy(DEFAULT_RETRY_BASE, DEFAULT_RETRY_MAX);

/// An exponential retry policy with the default jitter.
pub const fn retry_policy(base: TimeDelta, max: TimeDelta) -> RetryPolicy {
    BackoffStrategy::exponential(base)
        .with_jitter(Jitter::Relative(DEFAULT_RETRY_JITTER))
        .with_max(max)
}

/// `min(base * 2^(attempt - 1) * jitter, max)` with `jitter` uniform in `[0.75, 1.25]`.
pub fn compute_delay(attempt: u32, base: TimeDelta, max: TimeDelta) -> TimeDelta {
    retry_policy(base, max).backoff(attempt)
}

#[cfg(test)]
mod test {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn constant_backoff() {
        let delay = TimeDelta::minutes(1);
        let strategy = BackoffStrategy::constant(delay);

        for i in 1..100 {
            assert_eq!(strategy.backoff(i), delay);
        }
    }

    #[test]
    fn constant_backoff_with_absolute_jitter() {
        let delay = TimeDelta::minutes(1);
        let jitter = TimeDelta::seconds(10);
        let strategy = BackoffStrategy::constant(delay).with_jitter(Jitter::Absolute(jitter));

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= delay - jitter);
            assert!(backoff <= delay + jitter);
        }
    }

    #[test]
    fn constant_backoff_with_jitter_min() {
        let delay = TimeDelta::seconds(20);
        let jitter = TimeDelta::seconds(20);
        let min = TimeDelta::seconds(5);
        let strategy = BackoffStrategy::constant(delay)
            .with_jitter(Jitter::Absolute(jitter))
            .with_min(min);

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= min);
            assert!(backoff <= delay + jitter);
        }
    }

    #[test]
    fn exponential_backoff() {
        let base = TimeDelta::milliseconds(100);
        let strategy = BackoffStrategy::exponential(base);

        for i in 1..20 {
            assert_eq!(strategy.backoff(i), base * 2_i32.pow(i - 1));
        }
    }

    #[test]
    fn exponential_backoff_does_not_overflow() {
        let strategy =
            BackoffStrategy::exponential(TimeDelta::seconds(1)).with_max(TimeDelta::days(1));

        assert_eq!(strategy.backoff(u32::MAX), TimeDelta::days(1));
        assert_eq!(strategy.backoff(64), TimeDelta::days(1));
    }

    #[test]
    fn jitter_saturates_at_the_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let relative = BackoffStrategy::constant(TimeDelta::MAX).with_jitter(Jitter::Relative(0.5));
        let absolute =
            BackoffStrategy::constant(TimeDelta::MAX).with_jitter(Jitter::Absolute(TimeDelta::MAX));
        let negative = BackoffStrategy::constant(TimeDelta::MAX)
            .with_jitter(Jitter::Relative(f64::NEG_INFINITY));

        for _ in 0..100 {
            assert!(relative.backoff_with_rng(1, &mut rng) >= TimeDelta::zero());
            assert!(absolute.backoff_with_rng(1, &mut rng) >= TimeDelta::zero());
            assert!(negative.backoff_with_rng(1, &mut rng) >= TimeDelta::zero());
        }
        assert!(BackoffStrategy::exponential(TimeDelta::MAX)
            .with_jitter(Jitter::Relative(0.25))
            .backoff(u32::MAX)
            >= TimeDelta::zero());
    }

    #[test]
    fn exponential_backoff_with_max() {
        let strategy =
            BackoffStrategy::exponential(TimeDelta::minutes(1)).with_max(TimeDelta::minutes(10));

        for i in 1..100 {
            assert!(strategy.backoff(i) <= TimeDelta::minutes(10));
        }
    }

    #[test]
    fn max_is_applied_after_jitter() {
        let max = TimeDelta::seconds(30);
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(16))
            .with_jitter(Jitter::Relative(0.5))
            .with_max(max);

        for _ in 0..100 {
            assert!(strategy.backoff(2) <= max);
        }
    }

    #[test]
    fn compute_delay_stays_within_jitter_bounds() {
        let base = TimeDelta::seconds(1);
        let max = TimeDelta::seconds(30);

        for attempt in 1..=8 {
            let expected = (base * 2_i32.pow(attempt - 1)).num_milliseconds() as f64;
            for _ in 0..50 {
                let delay = compute_delay(attempt, base, max);
                let millis = delay.num_milliseconds() as f64;
                assert!(millis >= (expected * 0.75).min(30_000.0), "{attempt}: {millis}");
                assert!(millis <= (expected * 1.25).min(30_000.0), "{attempt}: {millis}");
            }
        }
    }

    #[test]
    fn compute_delay_is_capped() {
        for _ in 0..50 {
            let delay = compute_delay(10, DEFAULT_RETRY_BASE, DEFAULT_RETRY_MAX);
            assert_eq!(delay, DEFAULT_RETRY_MAX);
        }
    }

    #[test]
    fn seeded_rng_is_deterministic() {
        let policy = DEFAULT_RETRY_POLICY;
        let first = policy.backoff_with_rng(2, &mut StdRng::seed_from_u64(7));
        let second = policy.backoff_with_rng(2, &mut StdRng::seed_from_u64(7));

        assert_eq!(first, second);
        assert!(first >= TimeDelta::milliseconds(1500));
        assert!(first <= TimeDelta::milliseconds(2500));
    }
}
