//! Backoff between attempts on the same provider.

use rand::Rng;
use std::time::Duration;

/// Delay before retry number `attempt` (1-based: the delay after the first
/// failed attempt is `attempt = 1`).
///
/// Exponential from `base`, capped at `max`, with up to 25% random jitter
/// added below the cap. A server `Retry-After` hint wins when it is longer,
/// but is still capped.
pub fn backoff_delay(
    attempt: u32,
    base: Duration,
    max: Duration,
    retry_after: Option<Duration>,
) -> Duration {
    let exp = attempt.saturating_sub(1).min(20);
    let delay = base.saturating_mul(1u32 << exp).min(max);

    let jitter_ms = (delay.as_millis() as u64) / 4;
    let jitter = if jitter_ms > 0 {
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    } else {
        Duration::ZERO
    };
    let delay = (delay + jitter).min(max);

    match retry_after {
        Some(hint) if hint > delay => hint.min(max),
        _ => delay,
    }
}
