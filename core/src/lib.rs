pub mod config;
pub mod metrics;
pub mod rate_limit;
pub mod tls;

use std::time::Duration;

/// Delay used for the first reconnect attempt and after every stable run.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Compute the delay before the next reconnect attempt.
///
/// A connection that stayed up for at least `min_stable` and ended cleanly
/// resets the delay to [`INITIAL_BACKOFF`]. Anything else doubles the previous
/// delay, saturating at `max_backoff`.
pub fn next_backoff(
    previous: Duration,
    elapsed: Duration,
    ok: bool,
    max_backoff: Duration,
    min_stable: Duration,
) -> Duration {
    if ok && elapsed >= min_stable {
        return INITIAL_BACKOFF.min(max_backoff);
    }
    previous.saturating_mul(2).clamp(INITIAL_BACKOFF.min(max_backoff), max_backoff)
}

