//! Retry budgets and backoff arithmetic for API calls.
//!
//! Rate-limit responses and transient server errors recover on different
//! time scales, so they get distinct backoff curves: a 429 backs off on a
//! steeper `3^n` curve with a higher floor, while everything else uses the
//! usual `2^(n-1)` doubling. Both are capped and jittered.

use std::time::Duration;

use rand::Rng as _;

use crate::prelude::*;

/// First-failure backoff for the generic curve.
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Jitter applied to every computed backoff, as a fraction of the delay.
const JITTER_RATIO: f64 = 0.10;

/// How many times a failed request may be retried.
///
/// The configuration surface encodes "unlimited" as `-1`; internally we
/// keep it as a proper variant so nothing downstream has to compare
/// against a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "i64")]
pub enum Retries {
    /// Retry until the call succeeds or the run is cancelled.
    Unlimited,
    /// Retry at most this many times.
    Finite(u32),
}

impl Retries {
    /// May another retry be attempted after `failures` failed attempts?
    pub fn allows(self, failures: u32) -> bool {
        match self {
            Retries::Unlimited => true,
            Retries::Finite(max) => failures < max,
        }
    }
}

impl Default for Retries {
    fn default() -> Self {
        Retries::Finite(3)
    }
}

impl TryFrom<i64> for Retries {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Retries::Unlimited),
            n if n >= 0 => u32::try_from(n)
                .map(Retries::Finite)
                .map_err(|_| format!("retry count out of range: {}", n)),
            n => Err(format!(
                "invalid retry count {} (use -1 for unlimited, or a non-negative count)",
                n
            )),
        }
    }
}

/// Per-model retry policy: a budget plus a backoff ceiling.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: Retries,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(retries: Retries, max_backoff: Duration) -> Self {
        Self {
            retries,
            max_backoff,
        }
    }

    /// The backoff before retry number `failures` (1-based), without jitter.
    pub fn backoff(&self, failures: u32, rate_limited: bool) -> Duration {
        // Exponents are clamped so a long unlimited-retry run cannot
        // overflow; the cap takes over long before that matters.
        let exponent = failures.min(32) as i32;
        let factor = if rate_limited {
            3.0f64.powi(exponent)
        } else {
            2.0f64.powi(exponent - 1)
        };
        let raw = BASE_DELAY.as_secs_f64() * factor;
        Duration::from_secs_f64(raw.min(self.max_backoff.as_secs_f64()))
    }

    /// [`Self::backoff`] with uniform jitter applied.
    pub fn backoff_with_jitter(&self, failures: u32, rate_limited: bool) -> Duration {
        let base = self.backoff(failures, rate_limited).as_secs_f64();
        let jitter = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
        Duration::from_secs_f64((base * (1.0 + jitter)).max(0.0))
    }
}

/// Sleep out a backoff delay, waking early on cancellation.
pub async fn backoff_sleep(cancel: &CancellationToken, delay: Duration) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("cancelled during retry backoff")),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_backoff_secs: u64) -> RetryPolicy {
        RetryPolicy::new(Retries::Finite(5), Duration::from_secs(max_backoff_secs))
    }

    #[test]
    fn test_generic_curve_doubles() {
        let policy = policy(120);
        assert_eq!(policy.backoff(1, false), Duration::from_secs(1));
        assert_eq!(policy.backoff(2, false), Duration::from_secs(2));
        assert_eq!(policy.backoff(3, false), Duration::from_secs(4));
    }

    #[test]
    fn test_rate_limit_curve_triples_with_higher_floor() {
        let policy = policy(120);
        assert_eq!(policy.backoff(1, true), Duration::from_secs(3));
        assert_eq!(policy.backoff(2, true), Duration::from_secs(9));
        assert_eq!(policy.backoff(3, true), Duration::from_secs(27));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = policy(10);
        assert_eq!(policy.backoff(6, false), Duration::from_secs(10));
        assert_eq!(policy.backoff(6, true), Duration::from_secs(10));
        // Large attempt numbers must not overflow.
        assert_eq!(policy.backoff(1000, true), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = policy(120);
        for _ in 0..100 {
            let jittered = policy.backoff_with_jitter(3, false).as_secs_f64();
            assert!((3.6..=4.4).contains(&jittered), "jittered = {}", jittered);
        }
    }

    #[test]
    fn test_retries_budget() {
        assert!(Retries::Unlimited.allows(u32::MAX - 1));
        assert!(Retries::Finite(2).allows(0));
        assert!(Retries::Finite(2).allows(1));
        assert!(!Retries::Finite(2).allows(2));
        assert!(!Retries::Finite(0).allows(0));
    }

    #[test]
    fn test_retries_from_sentinel() {
        assert_eq!(Retries::try_from(-1).unwrap(), Retries::Unlimited);
        assert_eq!(Retries::try_from(4).unwrap(), Retries::Finite(4));
        assert!(Retries::try_from(-2).is_err());
    }

    #[tokio::test]
    async fn test_backoff_sleep_aborts_on_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = backoff_sleep(&cancel, Duration::from_secs(3600)).await;
        assert!(result.is_err());
    }
}
