//! Capped exponential backoff

use rand::Rng;
use std::time::Duration;

/// Exponential delay policy: `base * 2^(attempt - 1)`, never above `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Same as [`Backoff::delay`] plus up to 25% random jitter.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        jitter(self.delay(attempt), 0.25)
    }
}

/// Adds a random extra of up to `ratio * duration`.
pub fn jitter(duration: Duration, ratio: f64) -> Duration {
    let max_extra_ms = (duration.as_millis() as f64 * ratio.clamp(0.0, 1.0)) as u64;
    if max_extra_ms == 0 {
        return duration;
    }
    let extra = rand::thread_rng().gen_range(0..=max_extra_ms);
    duration + Duration::from_millis(extra)
}
