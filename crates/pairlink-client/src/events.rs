//! Events emitted by sessions for the UI and storage collaborators

use pairlink_core::{PeerId, ProgressStatus, ReceivedFile, RoomType, TransferRequest};
use tokio::sync::mpsc;

/// User-facing notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    FileTransferCompleted,
    MessageTransferCompleted,
    /// The received files differ from the accepted request
    FilesIncorrect,
}

impl Notice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Notice::FileTransferCompleted => "file-transfer-completed",
            Notice::MessageTransferCompleted => "message-transfer-completed",
            Notice::FilesIncorrect => "files-incorrect",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    PeerConnecting {
        peer_id: PeerId,
    },
    PeerConnected {
        peer_id: PeerId,
        /// Pairing code derived from the transport fingerprints; empty on the relay
        connection_hash: String,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    FilesTransferRequest {
        peer_id: PeerId,
        request: TransferRequest,
    },
    SetProgress {
        peer_id: PeerId,
        progress: f64,
        status: Option<ProgressStatus>,
    },
    FileReceived {
        peer_id: PeerId,
        file: ReceivedFile,
    },
    FilesReceived {
        peer_id: PeerId,
        files: Vec<ReceivedFile>,
        images_only: bool,
        total_size: u64,
    },
    FilesSent {
        peer_id: PeerId,
    },
    TextReceived {
        peer_id: PeerId,
        text: String,
    },
    NotifyUser(Notice),
    TransferSpeed {
        peer_id: PeerId,
        speed: String,
        time_left: String,
    },
    PeerDisplayNameChanged {
        peer_id: PeerId,
        display_name: String,
        /// Pairing secret to update in storage, if the peer is paired
        room_secret: Option<String>,
    },
    /// A newer secret replaced this one; storage should delete it
    RoomSecretObsolete {
        secret: String,
    },
    RoomTypeRemoved {
        peer_id: PeerId,
        room_type: RoomType,
    },
}

/// Clonable sender side of the event stream
#[derive(Clone, Debug)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: PeerEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("Event receiver dropped");
        }
    }
}
