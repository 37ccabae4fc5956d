use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Period of the background eviction sweep.
    pub sweep_interval: Duration,
    /// Age after which a connection is reclaimed even while checked out.
    pub broken_timeout: Duration,
    /// Pause after a failed connection attempt before trying again.
    pub retry_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            broken_timeout: Duration::from_secs(600),
            retry_backoff: Duration::from_millis(50),
        }
    }
}
