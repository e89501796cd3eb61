//! Reconnect policy for outbound links
//!
//! One parameterized policy applied uniformly to every outbound link:
//! a fixed delay between attempts and an optional retry cap. Inbound
//! links are never reconnected; the remote peer, as the outbound
//! party, owns reconnection of the links it initiated.

use std::time::Duration;

/// Default delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Reconnect policy for outbound links
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Fixed delay before each reconnect attempt
    pub delay: Duration,
    /// Maximum number of attempts, or `None` to retry indefinitely
    pub max_retries: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RECONNECT_DELAY,
            max_retries: None,
        }
    }
}

impl ReconnectPolicy {
    /// Policy with a fixed delay and unlimited retries
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_retries: None,
        }
    }

    /// Policy that never reconnects
    pub fn disabled() -> Self {
        Self {
            delay: Duration::ZERO,
            max_retries: Some(0),
        }
    }

    /// Delay to wait before the given attempt (1-based), or `None` when
    /// the retry cap is exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self.max_retries {
            Some(max) if attempt > max => None,
            _ => Some(self.delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_retries_indefinitely() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Some(DEFAULT_RECONNECT_DELAY));
        assert_eq!(policy.delay_for(10_000), Some(DEFAULT_RECONNECT_DELAY));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = ReconnectPolicy::fixed(Duration::from_millis(100));
        assert_eq!(policy.delay_for(7), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_retry_cap() {
        let policy = ReconnectPolicy {
            delay: Duration::from_secs(3),
            max_retries: Some(2),
        };
        assert!(policy.delay_for(1).is_some());
        assert!(policy.delay_for(2).is_some());
        assert!(policy.delay_for(3).is_none());
    }

    #[test]
    fn test_disabled_never_retries() {
        let policy = ReconnectPolicy::disabled();
        assert!(policy.delay_for(1).is_none());
    }
}
