//! Backoff policies for reconnection and auth-key negotiation.

use std::time::Duration;

/// A fixed-delay retry budget.
#[derive(Clone, Copy, Debug)]
pub struct BackoffSpec {
    /// Delay between attempts.
    pub delay: Duration,
    /// Maximum number of retries; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl BackoffSpec {
    pub fn fixed(delay: Duration, max_attempts: Option<u32>) -> Self {
        Self { delay, max_attempts }
    }

    /// Default for transport reconnection: 5 s apart, unbounded.
    pub fn connection_default() -> Self {
        Self::fixed(Duration::from_secs(5), None)
    }

    /// Default for auth-key negotiation: 3 s apart, at most 5 retries.
    pub fn auth_default() -> Self {
        Self::fixed(Duration::from_secs(3), Some(5))
    }

    /// The delay before retry number `attempt` (1-based), or `None` once the
    /// budget is spent.
    pub fn next(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt > max => None,
            _ => Some(self.delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_budget_runs_out() {
        let spec = BackoffSpec::fixed(Duration::from_secs(3), Some(2));
        assert_eq!(spec.next(1), Some(Duration::from_secs(3)));
        assert_eq!(spec.next(2), Some(Duration::from_secs(3)));
        assert_eq!(spec.next(3), None);
    }

    #[test]
    fn unbounded_budget_never_runs_out() {
        let spec = BackoffSpec::connection_default();
        assert_eq!(spec.next(1_000_000), Some(Duration::from_secs(5)));
    }
}
