//! Write side of the signaling transport
//!
//! The signaling transport (websocket to the relay server, its reconnect
//! policy and framing) lives outside this crate. Sessions only need a way
//! to hand it messages, which is what [`ServerConnection`] provides: a
//! clonable handle that queues [`ClientMessage`]s for the transport task
//! and silently drops them while the transport is down.

use crate::proto::ClientMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared handle to the signaling transport
#[derive(Clone, Debug)]
pub struct ServerConnection {
    tx: mpsc::UnboundedSender<ClientMessage>,
    connected: Arc<AtomicBool>,
}

impl ServerConnection {
    /// Create a handle and the receiving end the transport task drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            tx,
            connected: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    /// Queue a message; a no-op while the transport is not connected
    pub fn send(&self, msg: ClientMessage) {
        if !self.is_connected() {
            tracing::trace!("Signaling transport down, dropping outbound message");
            return;
        }
        if self.tx.send(msg).is_err() {
            tracing::debug!("Signaling transport task is gone, dropping outbound message");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Called by the transport task on connect and disconnect
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}
