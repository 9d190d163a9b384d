//! File chunking and reassembly
//!
//! [`Sender`] slices one file into transport-sized chunks and only puts the
//! next chunk on the wire while the transport has room for it. [`Receiver`]
//! collects the chunks of one file in order and tells the session when to
//! confirm progress back to the sender.

use crate::error::{Error, Result};
use crate::transport::{Backpressure, ChunkTransport};
use crate::types::{FileHeader, FileSource, OutgoingFile};
use crate::{
    DIRECT_DEFAULT_CHUNK_SIZE, DIRECT_HIGH_WATERMARK, DIRECT_LOW_WATERMARK, DIRECT_MAX_CHUNK_SIZE,
    MAX_UNCONFIRMED_BYTES, RELAY_CHUNK_SIZE,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Tunables of the transfer engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Chunk size on the relayed transport
    pub relay_chunk_size: usize,
    /// Direct chunk size when the connection gives no size hint
    pub direct_default_chunk_size: usize,
    /// Upper bound for direct chunks
    pub direct_max_chunk_size: usize,
    /// Direct buffer level that pauses the sender
    pub direct_high_watermark: u64,
    /// Direct buffer level that resumes the sender
    pub direct_low_watermark: u64,
    /// Relay: bytes in flight without confirmation.
    /// Receivers confirm after half of this.
    pub max_unconfirmed_bytes: u64,
    /// Minimum progress delta between two progress reports
    pub progress_step: f64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            relay_chunk_size: RELAY_CHUNK_SIZE,
            direct_default_chunk_size: DIRECT_DEFAULT_CHUNK_SIZE,
            direct_max_chunk_size: DIRECT_MAX_CHUNK_SIZE,
            direct_high_watermark: DIRECT_HIGH_WATERMARK,
            direct_low_watermark: DIRECT_LOW_WATERMARK,
            max_unconfirmed_bytes: MAX_UNCONFIRMED_BYTES,
            progress_step: 0.005,
        }
    }
}

impl TransferSettings {
    /// Chunk size for a direct connection advertising `max_message_size`
    pub fn direct_chunk_size(&self, max_message_size: Option<u64>) -> usize {
        match max_message_size {
            Some(max) if max > 0 => (max.min(self.direct_max_chunk_size as u64)) as usize,
            _ => self.direct_default_chunk_size,
        }
    }

    pub fn direct_backpressure(&self) -> Backpressure {
        Backpressure::Buffered {
            high: self.direct_high_watermark,
            low: self.direct_low_watermark,
        }
    }

    pub fn relay_backpressure(&self) -> Backpressure {
        Backpressure::Confirmation {
            window: self.max_unconfirmed_bytes,
        }
    }
}

/// Chunker for one outgoing file
pub struct Sender {
    file: OutgoingFile,
    chunk_size: usize,
    backpressure: Backpressure,
    bytes_sent: u64,
    bytes_received: u64,
    reader: Option<tokio::fs::File>,
    reader_pos: u64,
}

impl Sender {
    pub fn new(file: OutgoingFile, chunk_size: usize, backpressure: Backpressure) -> Self {
        Self {
            file,
            chunk_size: chunk_size.max(1),
            backpressure,
            bytes_sent: 0,
            bytes_received: 0,
            reader: None,
            reader_pos: 0,
        }
    }

    pub fn header(&self) -> FileHeader {
        self.file.header()
    }

    pub fn file(&self) -> &OutgoingFile {
        &self.file
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Bytes the receiver confirmed (relayed transport only)
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn is_file_end(&self) -> bool {
        self.bytes_sent >= self.file.size
    }

    fn next_chunk_len(&self) -> u64 {
        (self.file.size - self.bytes_sent.min(self.file.size)).min(self.chunk_size as u64)
    }

    /// Whether the transport has room for the next chunk
    pub fn has_space<T: ChunkTransport + ?Sized>(&self, transport: &T) -> bool {
        let next = self.next_chunk_len();
        match self.backpressure {
            Backpressure::Buffered { high, .. } => transport.buffered_amount() + next < high,
            Backpressure::Confirmation { window } => {
                self.bytes_sent.saturating_sub(self.bytes_received) + next <= window
            }
        }
    }

    /// Send chunks until the file ends, the transport closes or runs out of
    /// room. Returns the number of chunks sent.
    pub async fn pump<T: ChunkTransport + ?Sized>(&mut self, transport: &mut T) -> Result<usize> {
        let mut sent = 0;
        while !self.is_file_end() && transport.is_open() && self.has_space(transport) {
            let chunk = self.read_chunk().await?;
            let len = chunk.len() as u64;
            transport.send_chunk(chunk)?;
            self.bytes_sent += len;
            sent += 1;
        }
        if sent > 0 {
            tracing::trace!(
                "Sent {} chunks of {}, {}/{} bytes",
                sent,
                self.file.name,
                self.bytes_sent,
                self.file.size
            );
        }
        Ok(sent)
    }

    async fn read_chunk(&mut self) -> Result<Bytes> {
        let len = self.next_chunk_len() as usize;
        let start = self.bytes_sent;

        let chunk = match &self.file.source {
            FileSource::Memory(data) => {
                let start = start as usize;
                if start + len > data.len() {
                    return Err(Error::InvalidData(format!(
                        "{} is shorter than its declared size",
                        self.file.name
                    )));
                }
                data.slice(start..start + len)
            }
            FileSource::Path(path) => {
                if self.reader.is_none() {
                    self.reader = Some(tokio::fs::File::open(path).await?);
                    self.reader_pos = 0;
                }
                let reader = self
                    .reader
                    .as_mut()
                    .ok_or_else(|| Error::Transport("file reader unavailable".to_string()))?;
                if self.reader_pos != start {
                    reader.seek(SeekFrom::Start(start)).await?;
                }
                let mut buffer = vec![0u8; len];
                reader.read_exact(&mut buffer).await.map_err(|e| {
                    Error::InvalidData(format!("reading {} at {}: {}", self.file.name, start, e))
                })?;
                self.reader_pos = start + len as u64;
                Bytes::from(buffer)
            }
        };
        Ok(chunk)
    }

    /// Record a receive confirmation. Returns whether the caller should pump
    /// again: confirmations are the resume signal of the relayed transport.
    pub fn on_receive_confirmation(&mut self, bytes_received: u64) -> bool {
        self.bytes_received = bytes_received.min(self.file.size);
        matches!(self.backpressure, Backpressure::Confirmation { .. })
    }

    /// Rewind the cursor to `offset`, also backwards. The next [`pump`]
    /// resumes from there.
    ///
    /// [`pump`]: Sender::pump
    pub fn resend_from_offset(&mut self, offset: u64) {
        let offset = offset.min(self.file.size);
        tracing::debug!(
            "Resending {} from offset {} (was at {})",
            self.file.name,
            offset,
            self.bytes_sent
        );
        self.bytes_sent = offset;
        self.bytes_received = offset;
    }

    /// Swap the backpressure contract and chunk size, e.g. after the
    /// transport was replaced
    pub fn retarget(&mut self, chunk_size: usize, backpressure: Backpressure) {
        self.chunk_size = chunk_size.max(1);
        self.backpressure = backpressure;
    }
}

/// What a chunk did to a [`Receiver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Digested {
    /// Confirmation to send back, carrying the total bytes received
    pub confirm: Option<u64>,
    /// Whether the declared size has been reached
    pub complete: bool,
}

/// Digester for one incoming file
pub struct Receiver {
    header: FileHeader,
    buffer: Vec<Bytes>,
    bytes_received: u64,
    since_last_ack: u64,
    window: u64,
}

impl Receiver {
    pub fn new(header: FileHeader, window: u64) -> Self {
        Self {
            header,
            buffer: Vec::new(),
            bytes_received: 0,
            since_last_ack: 0,
            window,
        }
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Whether the declared size has been reached
    pub fn is_complete(&self) -> bool {
        self.bytes_received >= self.header.size
    }

    /// Bytes received beyond the declared size
    pub fn overshoot(&self) -> u64 {
        self.bytes_received.saturating_sub(self.header.size)
    }

    pub fn unchunk(&mut self, chunk: Bytes) -> Digested {
        let len = chunk.len() as u64;
        self.buffer.push(chunk);
        self.bytes_received += len;
        self.since_last_ack += len;

        let complete = self.is_complete();
        let confirm = if complete || 2 * self.since_last_ack > self.window {
            self.since_last_ack = 0;
            Some(self.bytes_received)
        } else {
            None
        };

        Digested { confirm, complete }
    }

    /// Hand over the collected chunks
    pub fn into_parts(self) -> (FileHeader, Vec<Bytes>) {
        (self.header, self.buffer)
    }
}
