//! Compensation scheduling configuration.

use chrono::Duration;

/// Cadence and selection windows for the compensation scheduler.
///
/// Reads from environment variables:
/// - `COMPENSATION_INTERVAL_SECS`: sweep cadence (default: `300`)
/// - `COMPENSATION_GRACE_SECS`: minimum row age before compensation
///   (default: `120`)
/// - `LOG_RETENTION_DAYS`: transaction log retention (default: `30`)
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub interval: std::time::Duration,
    pub grace: Duration,
    pub retention: Duration,
}

impl SchedulerConfig {
    /// Loads the configuration from environment variables, falling back
    /// to defaults.
    pub fn from_env() -> Self {
        let interval_secs = read_var("COMPENSATION_INTERVAL_SECS", 300);
        let grace_secs = read_var("COMPENSATION_GRACE_SECS", 120);
        let retention_days = read_var("LOG_RETENTION_DAYS", 30);
        Self {
            interval: std::time::Duration::from_secs(interval_secs),
            grace: Duration::seconds(grace_secs as i64),
            retention: Duration::days(retention_days as i64),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(300),
            grace: Duration::minutes(2),
            retention: Duration::days(30),
        }
    }
}

fn read_var(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.interval, std::time::Duration::from_secs(300));
        assert_eq!(config.grace, Duration::minutes(2));
        assert_eq!(config.retention, Duration::days(30));
    }
}
