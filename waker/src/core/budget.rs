//! Shared time budget helpers for bounded wake cycles.

use std::time::{Duration, Instant};

/// Return the remaining time budget until `deadline`, or `None` once it passed.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}

/// Timeout for the next call: `limit`, shortened to what is left of the budget.
pub fn call_timeout(limit: Duration, deadline: Instant) -> Option<Duration> {
    remaining_budget(deadline).map(|remaining| remaining.min(limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_deadline_has_no_budget() {
        assert_eq!(remaining_budget(Instant::now()), None);
        assert_eq!(call_timeout(Duration::from_secs(5), Instant::now()), None);
    }

    #[test]
    fn call_timeout_is_capped_by_limit() {
        let deadline = Instant::now() + Duration::from_secs(600);
        assert_eq!(
            call_timeout(Duration::from_secs(2), deadline),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn call_timeout_is_capped_by_remaining_budget() {
        let deadline = Instant::now() + Duration::from_millis(200);
        let timeout = call_timeout(Duration::from_secs(60), deadline).expect("budget left");
        assert!(timeout <= Duration::from_millis(200));
    }
}
