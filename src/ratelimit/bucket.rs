//! Token bucket limiter implementation.

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{Result, TurnstileError};

/// A limiter answers whether one more unit of work may proceed right now.
///
/// Implementations must tolerate concurrent calls on the same instance and
/// must never block.
pub trait Limiter: Send + Sync {
    /// Consume one permit if available. Returns `false` without waiting
    /// when the limiter is exhausted.
    fn allow(&self) -> bool;
}

/// Default burst for a given rate: half the rate, never below one.
pub fn default_burst(qps: f64) -> u32 {
    let half = (qps / 2.0).floor();
    if half >= u32::MAX as f64 {
        u32::MAX
    } else if half >= 1.0 {
        half as u32
    } else {
        1
    }
}

/// A token bucket that refills continuously at `rate` tokens per second
/// up to `burst` tokens.
///
/// The bucket starts full. Each granted call consumes exactly one token.
pub struct TokenBucket {
    /// Refill rate in tokens per second
    rate: f64,
    /// Maximum number of stored tokens
    burst: u32,
    /// Token level and the instant it was last brought up to date
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Validated token bucket parameters.
///
/// Building buckets from a `BucketParams` cannot fail, which lets a
/// limiter factory validate once and then construct freely.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketParams {
    rate: f64,
    burst: u32,
}

impl BucketParams {
    /// Validate bucket parameters.
    ///
    /// Fails when `rate` is not a finite positive number or `burst` is zero.
    pub fn new(rate: f64, burst: u32) -> Result<Self> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(TurnstileError::Config(format!(
                "token bucket rate must be positive, got {}",
                rate
            )));
        }
        if burst == 0 {
            return Err(TurnstileError::Config(
                "token bucket burst must be at least 1".to_string(),
            ));
        }
        Ok(Self { rate, burst })
    }

    /// Parameters derived from a request rate: `rate = qps`, `burst = max(qps / 2, 1)`.
    pub fn from_qps(qps: f64) -> Result<Self> {
        Self::new(qps, default_burst(qps))
    }

    /// Build a full bucket with these parameters.
    pub fn build(&self) -> TokenBucket {
        TokenBucket {
            rate: self.rate,
            burst: self.burst,
            state: Mutex::new(BucketState {
                tokens: self.burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }
}

impl TokenBucket {
    /// Create a new token bucket.
    ///
    /// Fails when `rate` is not a finite positive number or `burst` is zero.
    pub fn new(rate: f64, burst: u32) -> Result<Self> {
        Ok(BucketParams::new(rate, burst)?.build())
    }

    /// Get the refill rate in tokens per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Get the bucket capacity.
    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Get the current token level, refilled up to now.
    pub fn tokens(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Same as [`Limiter::allow`] but evaluated at `now`.
    pub fn allow_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // An instant older than the last refill adds nothing.
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let burst = self.burst as f64;
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(burst);
        state.last_refill = now;
    }
}

impl Limiter for TokenBucket {
    fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_default_burst() {
        assert_eq!(default_burst(2.0), 1);
        assert_eq!(default_burst(0.5), 1);
        assert_eq!(default_burst(10.0), 5);
        assert_eq!(default_burst(7.0), 3);
        assert_eq!(default_burst(1e12), u32::MAX);
    }

    #[test]
    fn test_params_from_qps() {
        let params = BucketParams::from_qps(10.0).unwrap();
        let bucket = params.build();
        assert_eq!(bucket.rate(), 10.0);
        assert_eq!(bucket.burst(), 5);
        assert!(BucketParams::from_qps(0.0).is_err());
    }

    #[test]
    fn test_invalid_rate_rejected() {
        assert!(TokenBucket::new(0.0, 1).is_err());
        assert!(TokenBucket::new(-3.0, 1).is_err());
        assert!(TokenBucket::new(f64::NAN, 1).is_err());
        assert!(TokenBucket::new(f64::INFINITY, 1).is_err());
    }

    #[test]
    fn test_zero_burst_rejected() {
        let err = TokenBucket::new(1_000_000.0, 0).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_burst_then_deny() {
        let bucket = TokenBucket::new(4.0, 3).unwrap();
        let now = Instant::now();

        for _ in 0..3 {
            assert!(bucket.allow_at(now));
        }
        assert!(!bucket.allow_at(now));
    }

    #[test]
    fn test_refill_after_one_interval() {
        let bucket = TokenBucket::new(2.0, 1).unwrap();
        let start = Instant::now();

        assert!(bucket.allow_at(start));
        assert!(!bucket.allow_at(start));

        let later = start + Duration::from_millis(500);
        assert!(bucket.allow_at(later));
        assert!(!bucket.allow_at(later));
    }

    #[test]
    fn test_refill_capped_at_burst() {
        let bucket = TokenBucket::new(10.0, 2).unwrap();
        let start = Instant::now();

        let much_later = start + Duration::from_secs(60);
        assert!(bucket.allow_at(much_later));
        assert!(bucket.allow_at(much_later));
        assert!(!bucket.allow_at(much_later));
    }

    #[test]
    fn test_earlier_instant_adds_nothing() {
        let bucket = TokenBucket::new(1.0, 1).unwrap();
        let start = Instant::now() + Duration::from_secs(5);

        assert!(bucket.allow_at(start));
        assert!(!bucket.allow_at(start - Duration::from_secs(3)));
        assert!(!bucket.allow_at(start));
    }

    #[test]
    fn test_concurrent_allow_never_oversells() {
        let bucket = Arc::new(TokenBucket::new(0.001, 50).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = bucket.clone();
                std::thread::spawn(move || (0..20).filter(|_| bucket.allow()).count())
            })
            .collect();

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50);
    }
}
