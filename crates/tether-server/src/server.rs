use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::drivers::builtin_registry;
use crate::listener::{Listener, ListenerConfig};
use crate::provider::Provider;
use metrics_exporter_prometheus::PrometheusBuilder;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tether_core::DriverRegistry;
use tether_pool::{ConnectionPool, SweepHandle};
use tracing::info;

/// Listener, dispatcher, provider and pool wired together.
pub struct Server {
    provider: Arc<Provider>,
    listener: Listener,
    sweeper: Mutex<Option<SweepHandle>>,
}

impl Server {
    pub fn new(config: &Config, registry: DriverRegistry) -> Self {
        let pool = ConnectionPool::new(config.pool.to_pool_config(), registry);
        let provider = Arc::new(Provider::new(pool));
        let dispatcher = Arc::new(Dispatcher::new(
            provider.clone(),
            DispatcherConfig {
                buffer_size: config.server.buffer_size,
                max_workers: config.server.max_workers,
                close_timeout: config.server.close_timeout(),
            },
        ));
        let listener = Listener::new(
            ListenerConfig {
                listen_addr: config.server.listen_addr.clone(),
                buffer_size: config.server.buffer_size,
                read_timeout: config.server.read_timeout(),
                propagate_errors: config.server.propagate_errors,
            },
            dispatcher,
        );
        Self {
            provider,
            listener,
            sweeper: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn provider(&self) -> &Arc<Provider> {
        &self.provider
    }

    pub async fn start(&self) -> anyhow::Result<SocketAddr> {
        let addr = self.listener.start().await?;
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(self.provider.pool().start_sweeper());
        }
        Ok(addr)
    }

    /// Stops accepting, ends the sweep and closes every pooled connection.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let stopped = self.listener.stop().await;
        let sweeper = self.sweeper.lock().take();
        if let Some(mut sweeper) = sweeper {
            sweeper.stop();
        }
        self.provider.pool().close_all().await;
        stopped
    }
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    if let Some(metrics) = &config.metrics {
        let addr: SocketAddr = metrics.listen_addr.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(addr = %addr, "metrics exporter listening");
    }

    let server = Server::new(&config, builtin_registry());
    let addr = server.start().await?;
    info!(addr = %addr, "tether server ready");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    server.shutdown().await
}
