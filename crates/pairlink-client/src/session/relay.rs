//! Relayed link through the signaling server
//!
//! There is nothing to negotiate: the caller says hello (`connected:false`),
//! the other side answers `connected:true`, and both consider the link up.

use super::link::{LinkEvent, Outbox};
use pairlink_core::proto::{decode_chunk, Message, SignalBody, SignalMessage};
use pairlink_core::PeerId;

#[derive(Debug, Default)]
pub struct RelayLink {
    handshaken: bool,
}

impl RelayLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stable(&self) -> bool {
        self.handshaken
    }

    /// Send the hello if we are the caller; otherwise wait for one
    pub fn start(&mut self, is_caller: bool, out: &Outbox<'_>) {
        if is_caller {
            out.signal(SignalMessage::handshake(false));
        }
    }

    pub fn refresh(&mut self, peer_id: &PeerId, is_caller: bool, out: &Outbox<'_>) {
        tracing::debug!("Refreshing relayed link to {}", peer_id);
        self.start(is_caller, out);
    }

    pub fn disconnect(&mut self) {
        self.handshaken = false;
    }

    pub fn on_signal(&mut self, peer_id: &PeerId, signal: SignalMessage, out: &Outbox<'_>) -> Option<LinkEvent> {
        match signal.into_body() {
            SignalBody::Handshake { connected } => {
                if !connected {
                    out.signal(SignalMessage::handshake(true));
                }
                self.handshaken = true;
                Some(LinkEvent::Stabilized)
            }
            other => {
                tracing::warn!("Unexpected signal on relayed link to {}: {:?}", peer_id, other);
                None
            }
        }
    }

    /// Unwrap a relayed message; chunks become file bytes
    pub fn on_relay(&mut self, peer_id: &PeerId, message: Message) -> Option<LinkEvent> {
        tracing::debug!("Relay receive from {}: {}", peer_id, message.kind());
        match message {
            Message::Chunk { chunk } => match decode_chunk(&chunk) {
                Ok(data) => Some(LinkEvent::Data(data)),
                Err(e) => {
                    tracing::warn!("Malformed chunk from {}: {}", peer_id, e);
                    None
                }
            },
            other => Some(LinkEvent::Message(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::rooms::Route;
    use pairlink_core::proto::ClientMessage;
    use pairlink_core::{RoomType, ServerConnection};

    fn route() -> Option<Route> {
        Some(Route {
            to: PeerId::new("b"),
            room_type: RoomType::PublicId,
            room_id: "room".to_string(),
        })
    }

    #[test]
    fn test_handshake() {
        let (server, mut rx) = ServerConnection::channel();
        server.set_connected(true);
        let out = Outbox::new(&server, route());
        let peer = PeerId::new("b");

        let mut caller = RelayLink::new();
        caller.start(true, &out);
        let hello = match rx.try_recv().unwrap() {
            ClientMessage::Signal(signal) => signal.signal,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(hello.connected, Some(false));

        let mut callee = RelayLink::new();
        assert_eq!(callee.on_signal(&peer, hello, &out), Some(LinkEvent::Stabilized));
        let reply = match rx.try_recv().unwrap() {
            ClientMessage::Signal(signal) => signal.signal,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(reply.connected, Some(true));

        assert!(!caller.is_stable());
        assert_eq!(caller.on_signal(&peer, reply, &out), Some(LinkEvent::Stabilized));
        assert!(caller.is_stable());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_chunks_unwrap_to_data() {
        let mut link = RelayLink::new();
        let peer = PeerId::new("b");
        assert_eq!(
            link.on_relay(&peer, Message::chunk(b"abc")),
            Some(LinkEvent::Data(bytes::Bytes::from_static(b"abc")))
        );
        assert_eq!(
            link.on_relay(&peer, Message::TextSent),
            Some(LinkEvent::Message(Message::TextSent))
        );
        assert_eq!(
            link.on_relay(&peer, Message::Chunk { chunk: "***".to_string() }),
            None
        );
    }
}
