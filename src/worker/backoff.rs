//! Schedule durations and retry backoff for scheduled services.

use std::sync::Arc;
use std::time::Duration;

/// A schedule duration that may also be unknown or unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Finite(Duration),
    /// No upper bound.
    Indefinite,
    /// Not set; treated as zero.
    Unknown,
}

impl Interval {
    pub const ZERO: Interval = Interval::Finite(Duration::ZERO);

    pub fn from_millis(millis: u64) -> Self {
        Interval::Finite(Duration::from_millis(millis))
    }

    /// Unknown becomes zero and indefinite becomes [`Duration::MAX`].
    pub fn normalize(self) -> Duration {
        match self {
            Interval::Finite(d) => d,
            Interval::Indefinite => Duration::MAX,
            Interval::Unknown => Duration::ZERO,
        }
    }

    /// Cap `value` by this interval used as an upper bound.
    ///
    /// An unknown bound caps at zero; an indefinite one does not cap.
    pub fn clamp(self, value: Duration) -> Duration {
        match self {
            Interval::Finite(max) => value.min(max),
            Interval::Indefinite => value,
            Interval::Unknown => Duration::ZERO,
        }
    }
}

impl From<Duration> for Interval {
    fn from(value: Duration) -> Self {
        Interval::Finite(value)
    }
}

impl Default for Interval {
    fn default() -> Self {
        Interval::ZERO
    }
}

/// Computes the next cumulative period from the failure count and the
/// normalized base period.
pub type BackoffStrategy = Arc<dyn Fn(u32, Duration) -> Duration + Send + Sync>;

/// `period + period * e^failures`, or `e^failures` ms for a zero period.
pub fn exponential(failure_count: u32, period: Duration) -> Duration {
    let exp = f64::from(failure_count).exp();
    if period.is_zero() {
        return from_millis_f64(exp);
    }
    let ms = millis(period);
    from_millis_f64(ms + ms * exp)
}

/// `period + period * ln(1 + failures)`. The default strategy.
pub fn logarithmic(failure_count: u32, period: Duration) -> Duration {
    let ms = millis(period);
    from_millis_f64(ms + ms * f64::from(failure_count).ln_1p())
}

/// `period + period * failures`.
pub fn linear(failure_count: u32, period: Duration) -> Duration {
    let ms = millis(period);
    from_millis_f64(ms + ms * f64::from(failure_count))
}

pub fn default_strategy() -> BackoffStrategy {
    Arc::new(logarithmic)
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn from_millis_f64(ms: f64) -> Duration {
    if ms.is_nan() || ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(ms / 1000.0).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_millis(1000);

    fn approx_ms(d: Duration, expected: f64) {
        let ms = millis(d);
        assert!((ms - expected).abs() < 0.5, "{ms} != {expected}");
    }

    #[test]
    fn strategies_after_two_failures() {
        approx_ms(logarithmic(2, PERIOD), 2098.6);
        approx_ms(exponential(2, PERIOD), 8389.06);
        assert_eq!(linear(2, PERIOD), Duration::from_millis(3000));
    }

    #[test]
    fn exponential_without_period() {
        approx_ms(exponential(0, Duration::ZERO), 1.0);
        approx_ms(exponential(3, Duration::ZERO), 20.09);
        assert_eq!(linear(3, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn unbounded_period_saturates() {
        assert_eq!(exponential(5, Duration::MAX), Duration::MAX);
        assert_eq!(logarithmic(1, Interval::Indefinite.normalize()), Duration::MAX);
    }

    #[test]
    fn clamp_by_bound() {
        let value = Duration::from_secs(5);
        assert_eq!(Interval::from_millis(2000).clamp(value), Duration::from_secs(2));
        assert_eq!(Interval::Indefinite.clamp(value), value);
        assert_eq!(Interval::Unknown.clamp(value), Duration::ZERO);
        assert_eq!(Interval::Unknown.normalize(), Duration::ZERO);
    }
}
