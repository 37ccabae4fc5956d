//! Transport packets: `"TP" u32(len) chunk`.
//!
//! A framed message is cut into chunks that fit one buffer each. Packets may
//! arrive split across reads; [`Reassembler`] keeps every partial piece until
//! the rest shows up.

use crate::codec::try_extract_frame;
use bytes::{BufMut, Bytes, BytesMut};
use tether_core::{TetherError, TetherResult};

pub const PACKET_MAGIC: [u8; 2] = *b"TP";
pub const PACKET_OVERHEAD: usize = 6;
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

pub fn max_chunk_len(buffer_size: usize) -> TetherResult<usize> {
    if buffer_size <= PACKET_OVERHEAD {
        return Err(TetherError::Malformed(format!(
            "buffer size {buffer_size} leaves no room for packet payload"
        )));
    }
    Ok(buffer_size - PACKET_OVERHEAD)
}

pub fn split_packets(frame: &[u8], buffer_size: usize) -> TetherResult<Vec<Bytes>> {
    let chunk_len = max_chunk_len(buffer_size)?;
    Ok(frame
        .chunks(chunk_len)
        .map(|chunk| {
            let mut buf = BytesMut::with_capacity(PACKET_OVERHEAD + chunk.len());
            buf.put_slice(&PACKET_MAGIC);
            buf.put_u32(chunk.len() as u32);
            buf.put_slice(chunk);
            buf.freeze()
        })
        .collect())
}

fn try_extract_packet(buf: &mut BytesMut) -> TetherResult<Option<Bytes>> {
    let magic_len = buf.len().min(PACKET_MAGIC.len());
    if buf[..magic_len] != PACKET_MAGIC[..magic_len] {
        return Err(TetherError::Malformed("bad packet magic".into()));
    }
    if buf.len() < PACKET_OVERHEAD {
        return Ok(None);
    }
    let chunk_len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
    if buf.len() < PACKET_OVERHEAD + chunk_len {
        return Ok(None);
    }
    let mut packet = buf.split_to(PACKET_OVERHEAD + chunk_len);
    Ok(Some(packet.split_off(PACKET_OVERHEAD).freeze()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    Waiting,
    Accumulating,
    PacketComplete,
    MessageComplete,
}

/// Per-peer packet reassembly.
#[derive(Debug)]
pub struct Reassembler {
    inbound: BytesMut,
    message: BytesMut,
    state: ReassemblyState,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            inbound: BytesMut::new(),
            message: BytesMut::new(),
            state: ReassemblyState::Waiting,
        }
    }

    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    pub fn pending_bytes(&self) -> usize {
        self.inbound.len() + self.message.len()
    }

    /// Feeds raw bytes read from the socket and returns every message frame
    /// completed by them, in arrival order.
    pub fn push(&mut self, bytes: &[u8]) -> TetherResult<Vec<Bytes>> {
        self.inbound.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut packet_done = false;
        while let Some(chunk) = try_extract_packet(&mut self.inbound)? {
            packet_done = true;
            self.message.extend_from_slice(&chunk);
            while let Some(frame) = try_extract_frame(&mut self.message)? {
                frames.push(frame);
            }
        }
        self.state = if !frames.is_empty() {
            ReassemblyState::MessageComplete
        } else if packet_done {
            ReassemblyState::PacketComplete
        } else if self.pending_bytes() > 0 {
            ReassemblyState::Accumulating
        } else {
            ReassemblyState::Waiting
        };
        Ok(frames)
    }

    pub fn reset(&mut self) {
        self.inbound.clear();
        self.message.clear();
        self.state = ReassemblyState::Waiting;
    }
}
