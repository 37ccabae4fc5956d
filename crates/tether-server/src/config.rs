use serde::Deserialize;
use std::time::Duration;
use tether_pool::PoolConfig;
use tether_protocol::packet::{DEFAULT_BUFFER_SIZE, PACKET_OVERHEAD};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub max_workers: usize,
    pub buffer_size: usize,
    pub read_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub propagate_errors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7070".to_string(),
            max_workers: 16,
            buffer_size: DEFAULT_BUFFER_SIZE,
            read_timeout_ms: 30_000,
            close_timeout_ms: 5_000,
            propagate_errors: false,
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PoolSection {
    pub sweep_interval_ms: u64,
    pub broken_timeout_ms: u64,
    pub retry_backoff_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            sweep_interval_ms: defaults.sweep_interval.as_millis() as u64,
            broken_timeout_ms: defaults.broken_timeout.as_millis() as u64,
            retry_backoff_ms: defaults.retry_backoff.as_millis() as u64,
        }
    }
}

impl PoolSection {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            broken_timeout: Duration::from_millis(self.broken_timeout_ms),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub span_events: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            span_events: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricsConfig {
    pub listen_addr: String,
}

impl Config {
    pub fn from_path(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.max_workers == 0 {
            return Err(anyhow::anyhow!("server.max_workers must be at least 1"));
        }
        if self.server.buffer_size <= PACKET_OVERHEAD {
            return Err(anyhow::anyhow!(format!(
                "server.buffer_size must exceed the {PACKET_OVERHEAD} byte packet header"
            )));
        }
        if self.pool.sweep_interval_ms == 0 {
            return Err(anyhow::anyhow!("pool.sweep_interval_ms must be positive"));
        }
        if let Some(metrics) = &self.metrics {
            metrics
                .listen_addr
                .parse::<std::net::SocketAddr>()
                .map_err(|e| anyhow::anyhow!("metrics.listen_addr: {e}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").expect("parse");
        assert_eq!(config.server.max_workers, 16);
        assert_eq!(config.pool.sweep_interval_ms, 1_000);
        assert!(config.metrics.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [server]
            listen_addr = "0.0.0.0:9000"
            buffer_size = 1024

            [pool]
            broken_timeout_ms = 120000

            [metrics]
            listen_addr = "127.0.0.1:9898"
            "#,
        )
        .expect("parse");
        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.server.buffer_size, 1024);
        assert_eq!(config.server.close_timeout_ms, 5_000);
        assert_eq!(config.pool.to_pool_config().broken_timeout.as_secs(), 120);
    }

    #[test]
    fn rejects_unusable_values() {
        assert!(Config::parse("[server]\nmax_workers = 0").is_err());
        assert!(Config::parse("[server]\nbuffer_size = 6").is_err());
        assert!(Config::parse("[metrics]\nlisten_addr = \"nowhere\"").is_err());
    }
}
