//! Message envelope: `"TM" u32(len) token u8(checksum)`.
//!
//! The token is the JSON form of a [`Message`]; the checksum is the XOR of all
//! token bytes with zero reserved (a zero XOR is sent as 1).

use crate::messages::Message;
use bytes::{BufMut, Bytes, BytesMut};
use tether_core::{TetherError, TetherResult};

pub const MESSAGE_MAGIC: [u8; 2] = *b"TM";
pub const MESSAGE_HEADER_LEN: usize = 6;
pub const MESSAGE_TRAILER_LEN: usize = 1;
pub const MAX_TOKEN_LEN: usize = 64 * 1024 * 1024;

pub fn checksum(token: &[u8]) -> u8 {
    match token.iter().fold(0u8, |acc, b| acc ^ b) {
        0 => 1,
        sum => sum,
    }
}

pub fn to_token(message: &Message) -> TetherResult<String> {
    serde_json::to_string(message).map_err(|e| TetherError::Malformed(e.to_string()))
}

pub fn from_token(token: &[u8]) -> TetherResult<Message> {
    serde_json::from_slice(token).map_err(|e| TetherError::Malformed(e.to_string()))
}

/// Wraps an already serialized token in the message envelope.
pub fn frame_token(token: &[u8]) -> TetherResult<Bytes> {
    if token.len() > MAX_TOKEN_LEN {
        return Err(TetherError::Malformed(format!(
            "token of {} bytes exceeds {MAX_TOKEN_LEN}",
            token.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_LEN + token.len() + MESSAGE_TRAILER_LEN);
    buf.put_slice(&MESSAGE_MAGIC);
    buf.put_u32(token.len() as u32);
    buf.put_slice(token);
    buf.put_u8(checksum(token));
    Ok(buf.freeze())
}

pub fn encode(message: &Message) -> TetherResult<Bytes> {
    let token = to_token(message)?;
    frame_token(token.as_bytes())
}

/// Decodes exactly one framed message, verifying its checksum.
pub fn decode(frame: &[u8]) -> TetherResult<Message> {
    let token_len = peek_token_len(frame)?
        .ok_or_else(|| TetherError::Malformed("truncated message header".into()))?;
    let expected_len = MESSAGE_HEADER_LEN + token_len + MESSAGE_TRAILER_LEN;
    if frame.len() != expected_len {
        return Err(TetherError::Malformed(format!(
            "message frame is {} bytes, header announces {expected_len}",
            frame.len()
        )));
    }
    let token = &frame[MESSAGE_HEADER_LEN..MESSAGE_HEADER_LEN + token_len];
    let expected = frame[expected_len - 1];
    let actual = checksum(token);
    if expected != actual {
        return Err(TetherError::ChecksumMismatch { expected, actual });
    }
    from_token(token)
}

/// Splits the first complete message frame off the front of `buf`.
pub fn try_extract_frame(buf: &mut BytesMut) -> TetherResult<Option<Bytes>> {
    let Some(token_len) = peek_token_len(buf)? else {
        return Ok(None);
    };
    let frame_len = MESSAGE_HEADER_LEN + token_len + MESSAGE_TRAILER_LEN;
    if buf.len() < frame_len {
        return Ok(None);
    }
    Ok(Some(buf.split_to(frame_len).freeze()))
}

fn peek_token_len(buf: &[u8]) -> TetherResult<Option<usize>> {
    let magic_len = buf.len().min(MESSAGE_MAGIC.len());
    if buf[..magic_len] != MESSAGE_MAGIC[..magic_len] {
        return Err(TetherError::Malformed("bad message magic".into()));
    }
    if buf.len() < MESSAGE_HEADER_LEN {
        return Ok(None);
    }
    let token_len = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]) as usize;
    if token_len > MAX_TOKEN_LEN {
        return Err(TetherError::Malformed(format!(
            "announced token of {token_len} bytes exceeds {MAX_TOKEN_LEN}"
        )));
    }
    Ok(Some(token_len))
}
