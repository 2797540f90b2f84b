//! Timing constants and backoff helpers for the sync layer.

use std::time::Duration;

/// Window during which a fetched entry is served without a network call.
pub const DEFAULT_STALE_TIME_SECS: u64 = 30;

/// Items requested per page by paginated lists.
pub const DEFAULT_PAGE_SIZE: u64 = 20;

/// Consecutive reconnect attempts before the socket gives up.
pub const SOCKET_RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Delay before the first reconnect attempt.
pub const SOCKET_RECONNECT_INITIAL_DELAY_MS: u64 = 1_000;

/// Upper bound for any single reconnect delay.
pub const SOCKET_RECONNECT_MAX_DELAY_MS: u64 = 5_000;

/// Exponential backoff with cap: attempt 1 waits `initial`, each following
/// attempt doubles, never exceeding `max`.
pub fn reconnect_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    const MAX_EXPONENT: u32 = 16;

    let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
    initial
        .checked_mul(1_u32 << exponent)
        .unwrap_or(max)
        .min(max)
}
