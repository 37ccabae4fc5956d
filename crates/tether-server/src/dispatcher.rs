//! Turns received frames into provider calls on a bounded set of workers and
//! writes one response per request back to the peer.

use crate::commands;
use crate::listener::{MessageSink, Peer};
use crate::provider::Provider;
use anyhow::Context;
use bytes::{Bytes, BytesMut};
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{TetherError, TetherResult};
use tether_protocol::codec::{self, try_extract_frame};
use tether_protocol::packet::split_packets;
use tether_protocol::{CommandKind, ExceptionReport, Message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub buffer_size: usize,
    pub max_workers: usize,
    pub close_timeout: Duration,
}

pub struct Dispatcher {
    provider: Arc<Provider>,
    config: DispatcherConfig,
    workers: Arc<Semaphore>,
    inbound: Mutex<HashMap<SocketAddr, BytesMut>>,
    send_lock: tokio::sync::Mutex<()>,
}

impl Dispatcher {
    pub fn new(provider: Arc<Provider>, config: DispatcherConfig) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(config.max_workers)),
            provider,
            config,
            inbound: Mutex::new(HashMap::new()),
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Appends `bytes` to the peer's buffer and splits off every complete
    /// frame. A framing error discards the peer's buffer.
    fn accumulate(&self, peer: SocketAddr, bytes: &[u8]) -> Vec<TetherResult<Bytes>> {
        let mut inbound = self.inbound.lock();
        let buf = inbound.entry(peer).or_default();
        buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            match try_extract_frame(buf) {
                Ok(Some(frame)) => frames.push(Ok(frame)),
                Ok(None) => break,
                Err(err) => {
                    buf.clear();
                    frames.push(Err(err));
                    break;
                }
            }
        }
        if buf.is_empty() {
            inbound.remove(&peer);
        }
        frames
    }

    async fn work(self: Arc<Self>, peer: Peer, frame: TetherResult<Bytes>) {
        let Ok(_permit) = self.workers.clone().acquire_owned().await else {
            warn!(peer = %peer.addr(), "worker pool closed, dropping message");
            return;
        };
        let response = match frame {
            Ok(frame) => self.process(&frame).await,
            Err(err) => exception(Uuid::nil(), "Decode", anyhow::Error::from(err)),
        };
        if let Err(err) = self.respond(&peer, &response).await {
            warn!(peer = %peer.addr(), error = %err, "response aborted");
        }
    }

    async fn process(&self, frame: &[u8]) -> Message {
        let request = match codec::decode(frame) {
            Ok(request) => request,
            Err(err) => {
                if matches!(err, TetherError::ChecksumMismatch { .. }) {
                    counter!("tether_checksum_errors_total").increment(1);
                }
                return exception(
                    Uuid::nil(),
                    "Decode",
                    anyhow::Error::from(err).context("decoding request"),
                );
            }
        };
        let source = request
            .kind()
            .map(CommandKind::name)
            .unwrap_or("Unknown");
        counter!("tether_commands_total", "command" => source).increment(1);
        debug!(command = source, guid = %request.guid, "dispatching");
        match commands::execute(&self.provider, &request)
            .await
            .with_context(|| format!("{source} failed"))
        {
            Ok(response) => response,
            Err(err) => exception(request.guid, source, err),
        }
    }

    /// Writes the packetized response, closes the socket and waits for the
    /// peer to acknowledge the close.
    async fn respond(&self, peer: &Peer, response: &Message) -> anyhow::Result<()> {
        let frame = codec::encode(response)?;
        let packets = split_packets(&frame, self.config.buffer_size)?;
        let mut stream = peer
            .take_stream()
            .await
            .context("peer already answered")?;
        {
            let _sending = self.send_lock.lock().await;
            for packet in &packets {
                stream.write_all(packet).await?;
            }
            stream.flush().await?;
            stream.shutdown().await?;
        }
        let mut drain = [0u8; 256];
        let closed = tokio::time::timeout(self.config.close_timeout, async {
            loop {
                match stream.read(&mut drain).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if closed.is_err() {
            debug!(peer = %peer.addr(), "peer did not close in time");
        }
        Ok(())
    }
}

impl MessageSink for Dispatcher {
    fn message_received(self: Arc<Self>, peer: Peer, frame: Bytes) {
        for frame in self.accumulate(peer.addr(), &frame) {
            tokio::spawn(self.clone().work(peer.clone(), frame));
        }
    }
}

/// Renders a failure as an Exception response. The kind comes from the first
/// [`TetherError`] in the chain.
fn exception(guid: Uuid, source: &str, err: anyhow::Error) -> Message {
    let kind = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<TetherError>())
        .map(TetherError::kind_name)
        .unwrap_or("ServerFault");
    counter!("tether_command_errors_total", "kind" => kind).increment(1);
    warn!(kind, source, error = %format!("{err:#}"), "command failed");
    let trace: Vec<String> = err.chain().map(ToString::to_string).collect();
    ExceptionReport {
        kind: kind.to_string(),
        message: err.root_cause().to_string(),
        source: source.to_string(),
        trace: trace.join("\n"),
    }
    .into_message(guid)
}
