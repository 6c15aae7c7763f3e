//! Transaction validity time windows.
//!
//! Times throughout the engine are `Duration`s since the Unix epoch, matching
//! the caller-provided deterministic clock used by the state machines.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Validity interval of a transaction, checked against the notary clock.
///
/// Either bound may be absent. A window with neither bound is always valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Transaction is invalid before this time.
    pub from_time: Option<Duration>,
    /// Transaction is invalid after this time.
    pub until_time: Option<Duration>,
}

impl TimeWindow {
    /// Window bounded on both sides.
    pub fn between(from_time: Duration, until_time: Duration) -> Self {
        Self {
            from_time: Some(from_time),
            until_time: Some(until_time),
        }
    }

    /// Window with only a lower bound.
    pub fn from_only(from_time: Duration) -> Self {
        Self {
            from_time: Some(from_time),
            until_time: None,
        }
    }

    /// Window with only an upper bound.
    pub fn until_only(until_time: Duration) -> Self {
        Self {
            from_time: None,
            until_time: Some(until_time),
        }
    }

    /// Check whether `now` falls within the window, allowing the clock to
    /// drift up to `tolerance` on either side.
    ///
    /// With tolerance 30s: `until_time = now - 29s` is still valid,
    /// `until_time = now - 31s` is not, and `until_time = now - 30s` sits
    /// exactly on the boundary and is accepted.
    pub fn contains(&self, now: Duration, tolerance: Duration) -> bool {
        if let Some(from) = self.from_time {
            if now + tolerance < from {
                return false;
            }
        }
        if let Some(until) = self.until_time {
            if now > until + tolerance {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: Duration = Duration::from_secs(30);

    fn now() -> Duration {
        Duration::from_secs(1_000_000)
    }

    #[test]
    fn test_window_containing_now_is_valid() {
        let window = TimeWindow::between(now() - Duration::from_secs(60), now() + Duration::from_secs(60));
        assert!(window.contains(now(), TOLERANCE));
    }

    #[test]
    fn test_expired_window_within_tolerance_is_valid() {
        // until = now - 29s, tolerance 30s: valid
        let window = TimeWindow::between(
            now() - Duration::from_secs(60),
            now() - Duration::from_secs(29),
        );
        assert!(window.contains(now(), TOLERANCE));
    }

    #[test]
    fn test_expired_window_beyond_tolerance_is_invalid() {
        // until = now - 31s, tolerance 30s: invalid
        let window = TimeWindow::between(
            now() - Duration::from_secs(60),
            now() - Duration::from_secs(31),
        );
        assert!(!window.contains(now(), TOLERANCE));
    }

    #[test]
    fn test_boundary_exactly_at_tolerance_is_valid() {
        let window = TimeWindow::until_only(now() - TOLERANCE);
        assert!(window.contains(now(), TOLERANCE));
    }

    #[test]
    fn test_future_window_beyond_tolerance_is_invalid() {
        let window = TimeWindow::from_only(now() + Duration::from_secs(31));
        assert!(!window.contains(now(), TOLERANCE));
    }

    #[test]
    fn test_future_window_within_tolerance_is_valid() {
        let window = TimeWindow::from_only(now() + Duration::from_secs(29));
        assert!(window.contains(now(), TOLERANCE));
    }

    #[test]
    fn test_unbounded_window_always_valid() {
        let window = TimeWindow {
            from_time: None,
            until_time: None,
        };
        assert!(window.contains(Duration::ZERO, Duration::ZERO));
    }
}
