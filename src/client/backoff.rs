//! Retry delay policies for the two client transports.
//!
//! The primary transport uses exponential backoff with symmetric jitter, so
//! that many clients dropped by the same outage do not reconnect in lockstep.
//! The SSE fallback uses a plain linear ramp.

use std::time::Duration;

use rand::Rng;

use crate::runtime_config::{FallbackOptions, TransportOptions};

/// Exponential backoff with randomisation.
///
/// `delay(n) = min(base * 2^n ± floor(r * factor * base * 2^n), max)` where
/// `r` is uniform in `[0, 1)` and the sign comes from the parity of
/// `floor(r * 10)`.
#[derive(Debug, Clone, PartialEq)]
pub struct JitteredBackoff {
    base_ms: u64,
    max_ms: u64,
    factor: f64,
}

impl JitteredBackoff {
    pub fn new(base: Duration, max: Duration, randomization_factor: f64) -> Self {
        Self {
            base_ms: base.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            factor: randomization_factor.clamp(0.0, 1.0),
        }
    }

    pub fn from_options(opts: &TransportOptions) -> Self {
        Self::new(
            Duration::from_millis(opts.reconnection_delay_ms),
            Duration::from_millis(opts.reconnection_delay_max_ms),
            opts.randomization_factor,
        )
    }

    /// Delay before retry number `attempt` (0-based), drawing from `rng`.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = 1u64.checked_shl(attempt.min(62)).unwrap_or(u64::MAX);
        let mut ms = self.base_ms.saturating_mul(exp);

        if self.factor > 0.0 {
            let r: f64 = rng.gen();
            let deviation = (r * self.factor * ms as f64).floor() as u64;
            ms = if ((r * 10.0).floor() as u64) & 1 == 0 {
                ms.saturating_sub(deviation)
            } else {
                ms.saturating_add(deviation)
            };
        }

        Duration::from_millis(ms.min(self.max_ms))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }
}

/// `delay(n) = min(base * n, cap)`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearBackoff {
    base: Duration,
    cap: Duration,
}

impl LinearBackoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    pub fn from_options(opts: &FallbackOptions) -> Self {
        Self::new(
            Duration::from_millis(opts.base_delay_ms),
            Duration::from_millis(opts.cap_delay_ms),
        )
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt).min(self.cap)
    }
}
