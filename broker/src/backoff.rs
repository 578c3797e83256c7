//! Reconnect backoff for [`crate::upstream_client::UpstreamClient`]: a pure
//! function of the number of consecutive failed attempts, so it is testable
//! without any notion of wall-clock time.

use std::time::Duration;

/// Attempts-based ladder, coarser the longer the outage has lasted:
/// a transient blip retries quickly, a prolonged outage backs off to a
/// steady one-per-minute cadence instead of hammering the server.
#[must_use]
pub fn next_delay(attempts: u32) -> Duration {
    match attempts {
        0..=100 => Duration::from_secs(3),
        101..=300 => Duration::from_secs(10),
        301..=500 => Duration::from_secs(30),
        _ => Duration::from_secs(60),
    }
}
