//! TCP front door: accepts peers, reassembles their packets and hands every
//! completed message frame to a [`MessageSink`].

use anyhow::{anyhow, Context};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_protocol::Reassembler;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One accepted socket. The stream is taken by whoever answers the peer.
#[derive(Clone)]
pub struct Peer {
    addr: SocketAddr,
    stream: Arc<Mutex<Option<TcpStream>>>,
}

impl Peer {
    fn new(addr: SocketAddr, stream: TcpStream) -> Self {
        Self {
            addr,
            stream: Arc::new(Mutex::new(Some(stream))),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn take_stream(&self) -> Option<TcpStream> {
        self.stream.lock().await.take()
    }
}

pub trait MessageSink: Send + Sync + 'static {
    fn message_received(self: Arc<Self>, peer: Peer, frame: Bytes);
}

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub listen_addr: String,
    pub buffer_size: usize,
    pub read_timeout: Duration,
    pub propagate_errors: bool,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<anyhow::Result<()>>,
}

pub struct Listener {
    config: ListenerConfig,
    sink: Arc<dyn MessageSink>,
    running: Mutex<Option<Running>>,
}

impl Listener {
    pub fn new(config: ListenerConfig, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            config,
            sink,
            running: Mutex::new(None),
        }
    }

    /// Binds and starts accepting. Calling it again while running returns the
    /// bound address.
    pub async fn start(&self) -> anyhow::Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            return Ok(current.local_addr);
        }
        let socket = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.config.listen_addr))?;
        let local_addr = socket.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            socket,
            self.config.clone(),
            self.sink.clone(),
            shutdown_rx,
        ));
        info!(addr = %local_addr, "listening");
        *running = Some(Running {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Ends the accept loop, then releases the port. A no-op when stopped.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };
        let _ = running.shutdown.send(true);
        let outcome = running
            .task
            .await
            .map_err(|e| anyhow!("accept loop panicked: {e}"))?;
        info!(addr = %running.local_addr, "listener stopped");
        outcome
    }
}

async fn accept_loop(
    socket: TcpListener,
    config: ListenerConfig,
    sink: Arc<dyn MessageSink>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            accepted = socket.accept() => match accepted {
                Ok((stream, addr)) => {
                    let sink = sink.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_peer(stream, addr, &config, sink).await {
                            warn!(peer = %addr, error = %err, "dropping peer message");
                        }
                    });
                }
                Err(err) if config.propagate_errors => {
                    return Err(anyhow::Error::from(err).context("accepting peer"));
                }
                Err(err) => error!(error = %err, "accept failed"),
            }
        }
    }
}

async fn serve_peer(
    stream: TcpStream,
    addr: SocketAddr,
    config: &ListenerConfig,
    sink: Arc<dyn MessageSink>,
) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let peer = Peer::new(addr, stream);
    let frames = tokio::time::timeout(config.read_timeout, read_message(&peer, config.buffer_size))
        .await
        .map_err(|_| anyhow!("no complete message within {}ms", config.read_timeout.as_millis()))??;
    debug!(peer = %addr, frames = frames.len(), "message received");
    for frame in frames {
        sink.clone().message_received(peer.clone(), frame);
    }
    Ok(())
}

/// Reads until at least one message frame is complete.
async fn read_message(peer: &Peer, buffer_size: usize) -> anyhow::Result<Vec<Bytes>> {
    let mut guard = peer.stream.lock().await;
    let stream = guard
        .as_mut()
        .ok_or_else(|| anyhow!("peer stream already taken"))?;
    let mut reassembler = Reassembler::new();
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(anyhow!(
                "peer closed with {} bytes of incomplete message",
                reassembler.pending_bytes()
            ));
        }
        let frames = reassembler.push(&buf[..n])?;
        if !frames.is_empty() {
            return Ok(frames);
        }
    }
}
