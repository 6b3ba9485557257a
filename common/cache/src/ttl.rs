//! Randomized expiry so entries written together don't expire together.

use rand::Rng;
use std::time::Duration;

/// `base + uniform(0, base * ratio)`.
pub fn jittered_ttl(base: Duration, ratio: f64) -> Duration {
    base + random_up_to(base.mul_f64(ratio.max(0.0)))
}

/// `base + uniform(0, max_extra)`.
pub fn ttl_with_extra(base: Duration, max_extra: Duration) -> Duration {
    base + random_up_to(max_extra)
}

fn random_up_to(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Milliseconds for PX-style arguments, never zero.
pub(crate) fn as_px(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}
