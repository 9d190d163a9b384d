//! Transport alternatives of a session
//!
//! A session talks to its peer over exactly one [`Link`]: a direct
//! connection or the relay through the signaling server. Both present the
//! same surface to the session (send a protocol message, expose a
//! [`ChunkTransport`] for file bytes, report [`LinkEvent`]s), so the state
//! machine never branches on the transport kind.

use super::direct::DirectLink;
use super::relay::RelayLink;
use super::rooms::Route;
use crate::events::EventSink;
use bytes::Bytes;
use pairlink_core::proto::{ClientMessage, Message, OutboundRelay, OutboundSignal, SignalMessage};
use pairlink_core::{
    Backpressure, ChunkTransport, Error, PeerId, Result, ServerConnection, TransferSettings,
};

/// Something a link surfaces to its session
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The link became usable
    Stabilized,
    /// A protocol message arrived
    Message(Message),
    /// File bytes arrived
    Data(Bytes),
    /// The transport has room for more chunks
    Drained,
}

/// Addressed writer to the signaling server for one peer
pub struct Outbox<'a> {
    server: &'a ServerConnection,
    route: Option<Route>,
}

impl<'a> Outbox<'a> {
    pub fn new(server: &'a ServerConnection, route: Option<Route>) -> Self {
        Self { server, route }
    }

    pub fn server(&self) -> &ServerConnection {
        self.server
    }

    pub fn signal(&self, signal: SignalMessage) {
        let Some(route) = &self.route else {
            tracing::warn!("No room to address signal through");
            return;
        };
        self.server.send(ClientMessage::Signal(OutboundSignal {
            to: route.to.clone(),
            room_type: route.room_type,
            room_id: route.room_id.clone(),
            signal,
        }));
    }

    pub fn relay(&self, message: Message) {
        let Some(route) = &self.route else {
            tracing::warn!("No room to address relay message through");
            return;
        };
        self.server.send(ClientMessage::WsRelay(OutboundRelay {
            to: route.to.clone(),
            room_type: route.room_type,
            room_id: route.room_id.clone(),
            message,
        }));
    }
}

pub enum Link {
    Direct(DirectLink),
    Relay(RelayLink),
}

impl Link {
    pub fn is_direct(&self) -> bool {
        matches!(self, Link::Direct(_))
    }

    pub fn is_stable(&self) -> bool {
        match self {
            Link::Direct(direct) => direct.is_stable(),
            Link::Relay(relay) => relay.is_stable(),
        }
    }

    pub fn send_message(&mut self, message: &Message, out: &Outbox<'_>) {
        match self {
            Link::Direct(direct) => direct.send_message(message),
            Link::Relay(_) => out.relay(message.clone()),
        }
    }

    /// Chunk size and backpressure for a new file on this link
    pub fn chunk_plan(&self, settings: &TransferSettings) -> (usize, Backpressure) {
        match self {
            Link::Direct(direct) => (
                settings.direct_chunk_size(direct.max_message_size()),
                settings.direct_backpressure(),
            ),
            Link::Relay(_) => (settings.relay_chunk_size, settings.relay_backpressure()),
        }
    }

    pub fn connection_hash(&self, is_caller: bool) -> String {
        match self {
            Link::Direct(direct) => direct.connection_hash(is_caller),
            Link::Relay(_) => String::new(),
        }
    }

    /// Tear down and re-establish the transport
    pub async fn refresh(
        &mut self,
        peer_id: &PeerId,
        is_caller: bool,
        out: &Outbox<'_>,
        events: &EventSink,
    ) {
        match self {
            Link::Direct(direct) => direct.refresh(is_caller, out, events).await,
            Link::Relay(relay) => relay.refresh(peer_id, is_caller, out),
        }
    }

    pub fn disconnect(&mut self) {
        match self {
            Link::Direct(direct) => direct.close(),
            Link::Relay(relay) => relay.disconnect(),
        }
    }
}

/// [`ChunkTransport`] view of a link
pub struct LinkPort<'l, 'o> {
    link: &'l mut Link,
    out: &'o Outbox<'o>,
}

impl<'l, 'o> LinkPort<'l, 'o> {
    pub fn new(link: &'l mut Link, out: &'o Outbox<'o>) -> Self {
        Self { link, out }
    }
}

impl ChunkTransport for LinkPort<'_, '_> {
    fn is_open(&self) -> bool {
        match &*self.link {
            Link::Direct(direct) => direct.is_stable(),
            Link::Relay(_) => self.out.server().is_connected(),
        }
    }

    fn buffered_amount(&self) -> u64 {
        match &*self.link {
            Link::Direct(direct) => direct.buffered_amount(),
            Link::Relay(_) => 0,
        }
    }

    fn send_chunk(&mut self, chunk: Bytes) -> Result<()> {
        match &mut *self.link {
            Link::Direct(direct) => direct.send_data(chunk),
            Link::Relay(_) => {
                if !self.out.server().is_connected() {
                    return Err(Error::ChannelClosed("signaling server".to_string()));
                }
                self.out.relay(Message::chunk(&chunk));
                Ok(())
            }
        }
    }
}
