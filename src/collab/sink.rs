use std::{io::Write, sync::Mutex};

use log::{trace, warn};

use super::MetadataSink;
use crate::metadata::encode_frame;

/// Writes wire-framed metadata records to any byte sink, typically a fifo
/// that an external consumer reads.
pub struct WriterMetadataSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterMetadataSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> MetadataSink for WriterMetadataSink<W> {
    fn process(&self, kind: [u8; 4], code: [u8; 4], payload: &[u8]) {
        let frame = encode_frame(kind, code, payload);
        if let Err(x) = self.writer.lock().unwrap().write_all(&frame) {
            warn!("metadata sink write failed: {}", x);
        }
    }
}

/// Logs metadata records instead of forwarding them anywhere.
pub struct LogMetadataSink {}

impl LogMetadataSink {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for LogMetadataSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataSink for LogMetadataSink {
    fn process(&self, kind: [u8; 4], code: [u8; 4], payload: &[u8]) {
        trace!(
            "metadata {}/{} ({} bytes)",
            String::from_utf8_lossy(&kind),
            String::from_utf8_lossy(&code),
            payload.len()
        );
    }
}
