//! Wire message definitions
//!
//! Three families of JSON messages: the peer protocol spoken between two
//! sessions, messages the signaling server delivers to us, and messages we
//! hand to the signaling server. Field names are camelCase and the `type`
//! tag is kebab-case to match the relay server.

use crate::types::{FileHeader, PeerId, RoomType, SessionState, TransferRequest};
use crate::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Peer protocol message, carried on the control channel or inside a relay envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    State {
        state: SessionState,
    },
    TransferRequest(TransferRequest),
    TransferResponse {
        accepted: bool,
    },
    TransferHeader(FileHeader),
    ReceiveProgress {
        progress: f64,
    },
    #[serde(rename_all = "camelCase")]
    ReceiveConfirmation {
        bytes_received: u64,
    },
    ResendRequest {
        offset: u64,
    },
    FileTransferComplete {
        success: bool,
        /// Seconds between header and completion
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
        /// File size in MB
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<f64>,
        /// MB/s
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
    },
    /// Base64 of the UTF-8 text
    Text {
        text: String,
    },
    TextSent,
    #[serde(rename_all = "camelCase")]
    DisplayNameChanged {
        #[serde(default)]
        display_name: Option<String>,
    },
    /// File bytes on the relayed transport, base64 encoded
    Chunk {
        chunk: String,
    },
}

impl Message {
    /// Encode a text message
    pub fn text(text: &str) -> Self {
        Message::Text {
            text: STANDARD.encode(text.as_bytes()),
        }
    }

    /// Encode a relayed chunk
    pub fn chunk(data: &[u8]) -> Self {
        Message::Chunk {
            chunk: STANDARD.encode(data),
        }
    }

    /// Message type name, as it appears on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            Message::State { .. } => "state",
            Message::TransferRequest(_) => "transfer-request",
            Message::TransferResponse { .. } => "transfer-response",
            Message::TransferHeader(_) => "transfer-header",
            Message::ReceiveProgress { .. } => "receive-progress",
            Message::ReceiveConfirmation { .. } => "receive-confirmation",
            Message::ResendRequest { .. } => "resend-request",
            Message::FileTransferComplete { .. } => "file-transfer-complete",
            Message::Text { .. } => "text",
            Message::TextSent => "text-sent",
            Message::DisplayNameChanged { .. } => "display-name-changed",
            Message::Chunk { .. } => "chunk",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Decode the payload of a `text` message
pub fn decode_text(encoded: &str) -> Result<String> {
    let bytes = STANDARD.decode(encoded)?;
    Ok(String::from_utf8(bytes)?)
}

/// Decode the payload of a `chunk` message
pub fn decode_chunk(encoded: &str) -> Result<Bytes> {
    Ok(Bytes::from(STANDARD.decode(encoded)?))
}

/// SDP description kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description exchanged during direct negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    /// The transport security fingerprint announced in this description
    pub fn fingerprint(&self) -> Option<&str> {
        self.sdp
            .split("\r\n")
            .find_map(|line| line.strip_prefix("a=fingerprint:"))
    }
}

/// ICE candidate exchanged during direct negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

/// Configuration handed to the direct connection (ICE servers etc.)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RtcConfig {
    #[serde(rename = "iceServers", default)]
    pub ice_servers: Vec<serde_json::Value>,
}

/// Capability flags announced by the signaling server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsConfig {
    #[serde(default)]
    pub ws_fallback: bool,
    #[serde(default)]
    pub rtc_config: RtcConfig,
}

/// A peer as announced by the signaling server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: PeerId,
    #[serde(default)]
    pub rtc_supported: bool,
}

/// Origin of a forwarded message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderRef {
    pub id: PeerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Description,
    Candidate,
}

/// Body of a `signal` message
///
/// Direct negotiation fills `signalType` plus `description` or `candidate`
/// (a missing candidate marks the end of candidates). The relay handshake
/// only carries `connected`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "signalType", default, skip_serializing_if = "Option::is_none")]
    pub signal_type: Option<SignalType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
}

/// Typed view of a [`SignalMessage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalBody {
    Description(SessionDescription),
    /// `None` is the end-of-candidates marker
    Candidate(Option<IceCandidate>),
    Handshake { connected: bool },
    Invalid,
}

impl SignalMessage {
    pub fn description(description: SessionDescription) -> Self {
        Self {
            signal_type: Some(SignalType::Description),
            description: Some(description),
            ..Default::default()
        }
    }

    pub fn candidate(candidate: Option<IceCandidate>) -> Self {
        Self {
            signal_type: Some(SignalType::Candidate),
            candidate,
            ..Default::default()
        }
    }

    pub fn handshake(connected: bool) -> Self {
        Self {
            connected: Some(connected),
            ..Default::default()
        }
    }

    pub fn into_body(self) -> SignalBody {
        match (self.signal_type, self.description, self.connected) {
            (Some(SignalType::Description), Some(description), _) => SignalBody::Description(description),
            (Some(SignalType::Candidate), _, _) => SignalBody::Candidate(self.candidate),
            (None, _, Some(connected)) => SignalBody::Handshake { connected },
            _ => SignalBody::Invalid,
        }
    }
}

/// `signal` as delivered by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundSignal {
    pub sender: SenderRef,
    #[serde(flatten)]
    pub signal: SignalMessage,
}

/// `signal` as handed to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundSignal {
    pub to: PeerId,
    pub room_type: RoomType,
    pub room_id: String,
    #[serde(flatten)]
    pub signal: SignalMessage,
}

/// `ws-relay` as delivered by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundRelay {
    pub sender: SenderRef,
    pub message: Message,
}

/// `ws-relay` as handed to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRelay {
    pub to: PeerId,
    pub room_type: RoomType,
    pub room_id: String,
    pub message: Message,
}

/// Messages the signaling server delivers to us
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    WsConfig { ws_config: WsConfig },
    #[serde(rename_all = "camelCase")]
    Peers {
        peers: Vec<PeerInfo>,
        room_type: RoomType,
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PeerJoined {
        peer: PeerInfo,
        room_type: RoomType,
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeft {
        peer_id: PeerId,
        #[serde(default)]
        room_type: Option<RoomType>,
        #[serde(default)]
        room_id: Option<String>,
        #[serde(default)]
        disconnect: bool,
    },
    Signal(InboundSignal),
    WsRelay(InboundRelay),
    #[serde(rename_all = "camelCase")]
    DisplayName { display_name: String },
    #[serde(rename_all = "camelCase")]
    SecretRoomDeleted { room_secret: String },
    Ping,
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Messages we hand to the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Signal(OutboundSignal),
    WsRelay(OutboundRelay),
    #[serde(rename_all = "camelCase")]
    RegenerateRoomSecret { room_secret: String },
    Pong,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
