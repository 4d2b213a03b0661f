//! Stream Reassembler
//!
//! Notifications arrive in MTU-sized chunks with no framing of their own.
//! Chunks are accumulated per device until the buffer ends with the frame
//! terminator. Buffering happens on raw bytes so a multi-byte character split
//! across two chunks survives.

use crate::infrastructure::bluetooth::protocol::FRAME_TERMINATOR;
use std::collections::HashMap;
use tracing::trace;

const TERMINATOR_BYTE: u8 = FRAME_TERMINATOR as u8;

#[derive(Debug, Default)]
pub struct StreamReassembler {
    buffers: HashMap<String, Vec<u8>>,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, returning the complete frame once one is terminated
    pub fn push(&mut self, device_id: &str, chunk: &[u8]) -> Option<String> {
        let buffer = self.buffers.entry(device_id.to_string()).or_default();
        buffer.extend_from_slice(chunk);
        trace!(
            device_id,
            buffered = buffer.len(),
            "Chunk received: {:?}",
            String::from_utf8_lossy(chunk)
        );

        if buffer.last() != Some(&TERMINATOR_BYTE) {
            return None;
        }

        let frame = std::mem::take(buffer);
        // A lone terminator with nothing before it is not a frame
        if frame.len() == 1 {
            return None;
        }
        Some(String::from_utf8_lossy(&frame).into_owned())
    }

    /// Drop any partial frame for a device
    pub fn clear(&mut self, device_id: &str) {
        self.buffers.remove(device_id);
    }

    /// Bytes held for a device that do not yet form a frame
    pub fn buffered(&self, device_id: &str) -> usize {
        self.buffers.get(device_id).map_or(0, Vec::len)
    }
}
