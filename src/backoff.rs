//! Delay policies: pacing between items and batches, capped exponential
//! backoff for retries. All waits are cancellable.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::step::ErrorClass;

/// Inter-item delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Pacing {
    #[default]
    None,
    Fixed(Duration),
    /// Uniformly random in `[min, max]`.
    Uniform { min: Duration, max: Duration },
}

impl Pacing {
    /// Uniform pacing from a seconds range; `min == max` is a fixed delay,
    /// zero is no delay.
    pub fn from_secs(min: u64, max: u64) -> Self {
        let (min, max) = (min.min(max), min.max(max));
        match (min, max) {
            (0, 0) => Pacing::None,
            (a, b) if a == b => Pacing::Fixed(Duration::from_secs(a)),
            (a, b) => Pacing::Uniform {
                min: Duration::from_secs(a),
                max: Duration::from_secs(b),
            },
        }
    }

    pub fn sample(&self) -> Duration {
        match *self {
            Pacing::None => Duration::ZERO,
            Pacing::Fixed(d) => d,
            Pacing::Uniform { min, max } if min >= max => min,
            Pacing::Uniform { min, max } => rand::thread_rng().gen_range(min..=max),
        }
    }
}

/// `min(base * 2^attempt, cap)`, stretched for rate limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryBackoff {
    pub base: Duration,
    pub cap: Duration,
    /// Multiplier applied to rate-limited retries. The cap still applies.
    pub rate_limit_factor: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(20),
            cap: Duration::from_secs(3600),
            rate_limit_factor: 3.0,
        }
    }
}

impl RetryBackoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn delay_for(&self, attempt: u32, class: ErrorClass) -> Duration {
        let delay = self.delay(attempt);
        if class == ErrorClass::RateLimited && self.rate_limit_factor > 1.0 {
            let stretched = delay.as_secs_f64() * self.rate_limit_factor;
            Duration::try_from_secs_f64(stretched)
                .unwrap_or(self.cap)
                .min(self.cap)
        } else {
            delay
        }
    }
}

/// Pacing plus retry policy, handed to the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BackoffScheduler {
    pub pacing: Pacing,
    pub retry: RetryBackoff,
}

impl BackoffScheduler {
    pub fn new(pacing: Pacing, retry: RetryBackoff) -> Self {
        Self { pacing, retry }
    }

    pub fn between_items(&self) -> Duration {
        self.pacing.sample()
    }

    pub fn retry_delay(&self, attempt: u32, class: ErrorClass) -> Duration {
        self.retry.delay_for(attempt, class)
    }
}

/// Sleep for `duration` unless cancelled first. Returns false on cancellation.
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
