use crate::codec;
use crate::messages::Message;
use crate::packet::{split_packets, Reassembler};
use anyhow::{anyhow, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// Sends one request and waits for the single response the server writes
/// before closing the socket.
pub async fn send_request<A: ToSocketAddrs>(
    addr: A,
    request: &Message,
    buffer_size: usize,
    timeout: Duration,
) -> Result<Message> {
    tokio::time::timeout(timeout, exchange(addr, request, buffer_size))
        .await
        .map_err(|_| anyhow!("no response within {}ms", timeout.as_millis()))?
}

async fn exchange<A: ToSocketAddrs>(
    addr: A,
    request: &Message,
    buffer_size: usize,
) -> Result<Message> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let frame = codec::encode(request)?;
    for packet in split_packets(&frame, buffer_size)? {
        stream.write_all(&packet).await?;
    }
    stream.flush().await?;

    let mut reassembler = Reassembler::new();
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(anyhow!(
                "connection closed with {} bytes of incomplete response",
                reassembler.pending_bytes()
            ));
        }
        if let Some(frame) = reassembler.push(&buf[..n])?.into_iter().next() {
            let response = codec::decode(&frame)?;
            debug!(id = response.id, guid = %response.guid, "response received");
            return Ok(response);
        }
    }
}
