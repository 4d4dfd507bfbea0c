//! Retry budget configuration.

/// Retry policy applied when Confirm is rejected or a sibling branch has
/// failed.
///
/// Reads from environment variables:
/// - `TCC_RETRY_ENABLED`: whether the budget applies (default: `true`)
/// - `TCC_MAX_RETRY_COUNT`: retries before forcing rollback (default: `3`)
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retry_count: u32,
}

impl RetryPolicy {
    /// Loads the policy from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Self {
        Self {
            enabled: std::env::var("TCC_RETRY_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(true),
            max_retry_count: std::env::var("TCC_MAX_RETRY_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
        }
    }

    /// The budget recorded on new action states. Disabling the policy
    /// makes the budget effectively unbounded.
    pub fn effective_max(&self) -> u32 {
        if self.enabled { self.max_retry_count } else { u32::MAX }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retry_count: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_budget_is_three() {
        let policy = RetryPolicy::default();
        assert!(policy.enabled);
        assert_eq!(policy.max_retry_count, 3);
        assert_eq!(policy.effective_max(), 3);
    }

    #[test]
    fn disabled_policy_is_unbounded() {
        let policy = RetryPolicy {
            enabled: false,
            max_retry_count: 3,
        };
        assert_eq!(policy.effective_max(), u32::MAX);
    }
}
