//! Certificate lease policy

use std::time::Duration;

/// Effective certificate lifetime for a request
///
/// An absent request falls back to `default`. The result never exceeds `max`.
#[must_use]
pub fn lease_duration(requested: Option<Duration>, default: Duration, max: Duration) -> Duration {
    requested.unwrap_or(default).min(max)
}

/// Default and maximum lease pair for one certificate kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub default: Duration,
    pub max: Duration,
}

impl LeasePolicy {
    #[must_use]
    pub const fn new(default: Duration, max: Duration) -> Self {
        Self { default, max }
    }

    #[must_use]
    pub fn lease(&self, requested: Option<Duration>) -> Duration {
        lease_duration(requested, self.default, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);
    const TWO_HOURS: Duration = Duration::from_secs(7200);

    #[test]
    fn test_absent_request_uses_default() {
        assert_eq!(lease_duration(None, HOUR, TWO_HOURS), HOUR);
    }

    #[test]
    fn test_request_over_max_is_clamped() {
        let requested = Some(Duration::from_secs(10_000));
        assert_eq!(lease_duration(requested, HOUR, TWO_HOURS), TWO_HOURS);
    }

    #[test]
    fn test_short_request_is_kept() {
        let requested = Some(Duration::from_secs(100));
        assert_eq!(lease_duration(requested, HOUR, TWO_HOURS), Duration::from_secs(100));
    }

    #[test]
    fn test_policy_clamps_default() {
        let policy = LeasePolicy::new(Duration::from_secs(9000), TWO_HOURS);
        assert_eq!(policy.lease(None), TWO_HOURS);
    }
}
