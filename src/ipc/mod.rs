//! Datagram IPC with a shared endpoint registry.
//!
//! Endpoints register by name in a registry shared between processes and may
//! claim a numeric owner id that peers resolve without knowing the socket
//! path. Every datagram carries a fixed header with a magic constant, the
//! total size, and the sender's registry slot; a bad header is a fatal
//! decode error at the recipient.

use crate::Result;
use crate::env;
use crate::error::IpcError;
use miette::{Context, IntoDiagnostic};

pub mod endpoint;
pub mod registry;

pub use endpoint::Endpoint;
pub use registry::SharedRegistry;

/// Magic constant prefixing every datagram.
pub const MSG_MAGIC: u32 = 0x78ac39d1;

/// Maximum total message size, header included.
pub const MAX_MSG_SIZE: usize = 1024;

/// Fixed header: magic (u32), size (u32), source slot (i32), little endian.
pub const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcTimeout {
    /// Poll without blocking.
    Immediate,
    /// Block until a message arrives.
    Forever,
    /// Block up to the given number of milliseconds.
    Millis(u64),
}

/// A received datagram with its header stripped.
#[derive(Debug, Clone)]
pub struct IncomingMsg {
    /// Registry slot of the sender, for replies.
    pub src_slot: i32,
    pub payload: Vec<u8>,
}

pub(crate) fn encode_frame(src_slot: i32, payload: &[u8]) -> Result<Vec<u8>> {
    let size = HEADER_LEN + payload.len();
    if size > MAX_MSG_SIZE {
        return Err(IpcError::MessageTooLarge {
            size,
            max: MAX_MSG_SIZE,
        }
        .into());
    }
    let mut frame = Vec::with_capacity(size);
    frame.extend_from_slice(&MSG_MAGIC.to_le_bytes());
    frame.extend_from_slice(&(size as u32).to_le_bytes());
    frame.extend_from_slice(&src_slot.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub(crate) fn decode_frame(buf: &[u8]) -> Result<IncomingMsg> {
    if buf.len() < HEADER_LEN {
        return Err(IpcError::Truncated {
            expected: HEADER_LEN,
            actual: buf.len(),
        }
        .into());
    }
    let magic = u32::from_le_bytes(buf[0..4].try_into().expect("sliced"));
    if magic != MSG_MAGIC {
        return Err(IpcError::BadMagic { magic }.into());
    }
    let size = u32::from_le_bytes(buf[4..8].try_into().expect("sliced")) as usize;
    if size != buf.len() {
        return Err(IpcError::Truncated {
            expected: size,
            actual: buf.len(),
        }
        .into());
    }
    let src_slot = i32::from_le_bytes(buf[8..12].try_into().expect("sliced"));
    Ok(IncomingMsg {
        src_slot,
        payload: buf[HEADER_LEN..].to_vec(),
    })
}

pub(crate) fn serialize<T: serde::Serialize>(msg: &T) -> Result<Vec<u8>> {
    if *env::PCD_IPC_JSON {
        serde_json::to_vec(msg)
            .into_diagnostic()
            .wrap_err("failed to serialize IPC message as JSON")
    } else {
        rmp_serde::to_vec(msg)
            .into_diagnostic()
            .wrap_err("failed to serialize IPC message as MessagePack")
    }
}

pub(crate) fn deserialize<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if *env::PCD_IPC_JSON {
        serde_json::from_slice(bytes)
            .into_diagnostic()
            .wrap_err("failed to deserialize IPC JSON payload")
    } else {
        rmp_serde::from_slice(bytes)
            .into_diagnostic()
            .wrap_err("failed to deserialize IPC MessagePack payload")
    }
}
