use std::time::Duration;

/// Recognized configuration options and their effects (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepalivedConfig {
    /// Number of worker tasks draining the keepalive ingress queue.
    pub handler_count: usize,
    /// Seconds; applied when an entity's `keepalive_timeout` is 0.
    pub default_keepalive_timeout: u32,
    /// Monitor sweep cadence.
    pub sweep_interval: Duration,
    /// Keepalive ingress queue size.
    pub queue_capacity: usize,
}

pub const DEFAULT_HANDLER_COUNT: usize = 10;
pub const DEFAULT_KEEPALIVE_TIMEOUT: u32 = 120;
pub const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 600;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

impl Default for KeepalivedConfig {
    fn default() -> Self {
        Self {
            handler_count: DEFAULT_HANDLER_COUNT,
            default_keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl KeepalivedConfig {
    /// Loads configuration from the environment, falling back to the
    /// defaults named in spec.md §6 for anything unset.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Ok(raw) = std::env::var("KEEPALIVED_HANDLER_COUNT") {
            config.handler_count = raw
                .parse()
                .expect("KEEPALIVED_HANDLER_COUNT must be a positive integer");
        }
        if let Ok(raw) = std::env::var("KEEPALIVED_DEFAULT_KEEPALIVE_TIMEOUT") {
            config.default_keepalive_timeout = raw
                .parse()
                .expect("KEEPALIVED_DEFAULT_KEEPALIVE_TIMEOUT must be a valid number of seconds");
        }
        if let Ok(raw) = std::env::var("KEEPALIVED_SWEEP_INTERVAL_SECONDS") {
            let seconds: u64 = raw
                .parse()
                .expect("KEEPALIVED_SWEEP_INTERVAL_SECONDS must be a valid number of seconds");
            config.sweep_interval = Duration::from_secs(seconds);
        }
        if let Ok(raw) = std::env::var("KEEPALIVED_QUEUE_CAPACITY") {
            config.queue_capacity = raw
                .parse()
                .expect("KEEPALIVED_QUEUE_CAPACITY must be a positive integer");
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = KeepalivedConfig::default();
        assert_eq!(config.handler_count, 10);
        assert_eq!(config.default_keepalive_timeout, 120);
        assert_eq!(config.sweep_interval, Duration::from_secs(600));
        assert_eq!(config.queue_capacity, 10);
    }
}
