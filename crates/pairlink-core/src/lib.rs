//! pairlink Core - Shared types, protocols, and the transfer engine
//!
//! This crate provides the building blocks for pairlink peer sessions:
//! the JSON wire protocol spoken between peers and with the signaling
//! server, the chunk transport contract shared by the direct and relayed
//! transports, and the chunker/digester pair that moves file bytes.

pub mod assembly;
pub mod chunk;
pub mod error;
pub mod proto;
pub mod signaling;
pub mod throughput;
pub mod transport;
pub mod types;

pub use chunk::{Receiver, Sender, TransferSettings};
pub use error::{Error, Result};
pub use signaling::ServerConnection;
pub use transport::{
    Backpressure, ChunkTransport, ConnectionFactory, DirectConnection, DirectEvent, DirectEventSink,
    DirectSignal,
};
pub use types::*;

/// Chunk size used on the relayed transport: 64 KiB
pub const RELAY_CHUNK_SIZE: usize = 64 * 1024;

/// Chunk size on the direct transport when the connection gives no size hint: 256 KiB
pub const DIRECT_DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Upper bound for direct transport chunks: 1 MiB
pub const DIRECT_MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Bytes that may be in flight without a receive confirmation: 1 MiB
pub const MAX_UNCONFIRMED_BYTES: u64 = 1024 * 1024;

/// Direct data channel buffer level that pauses the sender: 10 MiB
pub const DIRECT_HIGH_WATERMARK: u64 = 10 * 1024 * 1024;

/// Direct data channel buffer level that resumes the sender: 4 MiB
pub const DIRECT_LOW_WATERMARK: u64 = 4 * 1024 * 1024;

/// Length of a pairing secret under the current scheme
pub const PAIR_SECRET_LEN: usize = 256;
