//! In-process signaling hub for demos and tests
//!
//! [`Loopback`] plays the signaling server for a set of registries living
//! in one process: every node sits in the same IP room, `signal` and
//! `ws-relay` messages are forwarded to their addressee, and direct
//! connections run over a shared [`MockDirectNetwork`]. Everything is driven
//! step by step so callers can interleave faults with the protocol.

use crate::events::{EventSink, PeerEvent};
use crate::registry::{Command, Input, Registry, ServerEvent};
use crate::session::SessionContext;
use pairlink_core::proto::{
    ClientMessage, InboundRelay, InboundSignal, Message, PeerInfo, SenderRef, ServerMessage, WsConfig,
};
use pairlink_core::transport::mock::MockDirectNetwork;
use pairlink_core::{DirectEvent, DirectSignal, PeerId, RoomType, ServerConnection, TransferSettings};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Room every loopback node joins
pub const LOOPBACK_ROOM: &str = "127.0.0.1";

/// Steps [`Loopback::run_until`] takes before giving up
pub const MAX_ROUNDS: usize = 100_000;

#[derive(Error, Debug)]
pub enum LoopbackError {
    #[error("No progress after {rounds} rounds")]
    Stalled { rounds: usize },

    #[error("Condition not met within {rounds} rounds")]
    RoundLimit { rounds: usize },

    #[error("Unknown node {0}")]
    UnknownNode(PeerId),

    #[error("Could not generate a node id: {0}")]
    Random(String),
}

pub type Result<T> = std::result::Result<T, LoopbackError>;

/// One registry wired to the hub
pub struct Node {
    id: PeerId,
    display_name: String,
    rtc_supported: bool,
    registry: Registry,
    server: ServerConnection,
    server_rx: mpsc::UnboundedReceiver<ClientMessage>,
    direct_rx: mpsc::UnboundedReceiver<DirectSignal>,
    events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    inbox: VecDeque<ServerEvent>,
    commands: VecDeque<Command>,
    events: Vec<PeerEvent>,
    /// Protocol messages that reached this node, on either transport
    received: Vec<(PeerId, Message)>,
}

impl Node {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Events emitted so far
    pub fn events(&self) -> &[PeerEvent] {
        &self.events
    }

    /// Drain the collected events
    pub fn take_events(&mut self) -> Vec<PeerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Protocol messages received so far, chunks excluded
    pub fn received(&self) -> &[(PeerId, Message)] {
        &self.received
    }

    fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            rtc_supported: self.rtc_supported,
        }
    }

    fn record(&mut self, from: &PeerId, message: &Message) {
        if !matches!(message, Message::Chunk { .. }) {
            self.received.push((from.clone(), message.clone()));
        }
    }

    /// Handle everything queued for this node. Direct events go first so a
    /// refreshed connection exists before signals for it are applied.
    async fn step(&mut self) -> usize {
        let mut handled = 0;

        while let Ok(signal) = self.direct_rx.try_recv() {
            if let DirectEvent::ControlMessage(text) = &signal.event {
                if let Ok(message) = Message::from_json(text) {
                    let from = signal.peer_id.clone();
                    self.record(&from, &message);
                }
            }
            self.registry.handle(Input::Direct(signal)).await;
            handled += 1;
        }

        while let Some(event) = self.inbox.pop_front() {
            self.registry.handle(Input::Server(event)).await;
            handled += 1;
        }

        while let Some(command) = self.commands.pop_front() {
            self.registry.handle(Input::Command(command)).await;
            handled += 1;
        }

        while let Ok(event) = self.events_rx.try_recv() {
            self.events.push(event);
        }
        handled
    }
}

pub struct Loopback {
    network: MockDirectNetwork,
    ws_fallback: bool,
    nodes: Vec<Node>,
    rounds: usize,
}

impl Loopback {
    pub fn new(ws_fallback: bool) -> Self {
        Self::with_network(MockDirectNetwork::new(), ws_fallback)
    }

    pub fn with_network(network: MockDirectNetwork, ws_fallback: bool) -> Self {
        Self {
            network,
            ws_fallback,
            nodes: Vec::new(),
            rounds: 0,
        }
    }

    pub fn network(&self) -> &MockDirectNetwork {
        &self.network
    }

    /// Steps taken so far
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    pub fn node(&self, id: &PeerId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn node_mut(&mut self, id: &PeerId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| &n.id == id)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Connect a new endpoint to the hub and announce it to the room
    pub fn add_node(
        &mut self,
        rtc_supported: bool,
        settings: TransferSettings,
        download_dir: Option<PathBuf>,
    ) -> Result<PeerId> {
        let id = generate_node_id()?;
        let display_name = format!("Node {}", self.nodes.len() + 1);

        let (server, server_rx) = ServerConnection::channel();
        server.set_connected(true);
        let (events, events_rx) = EventSink::channel();
        let ctx = SessionContext {
            server: server.clone(),
            events,
            settings,
            download_dir,
        };
        let factory = Arc::new(self.network.factory(id.clone()));
        let (registry, direct_rx) = Registry::new(ctx, factory, rtc_supported);

        let mut node = Node {
            id: id.clone(),
            display_name: display_name.clone(),
            rtc_supported,
            registry,
            server,
            server_rx,
            direct_rx,
            events_rx,
            inbox: VecDeque::new(),
            commands: VecDeque::new(),
            events: Vec::new(),
            received: Vec::new(),
        };

        let others: Vec<PeerInfo> = self.nodes.iter().map(Node::info).collect();
        node.inbox.extend([
            ServerEvent::Connected,
            ServerEvent::Message(ServerMessage::WsConfig {
                ws_config: WsConfig {
                    ws_fallback: self.ws_fallback,
                    ..WsConfig::default()
                },
            }),
            ServerEvent::Message(ServerMessage::DisplayName { display_name }),
            ServerEvent::Message(ServerMessage::Peers {
                peers: others,
                room_type: RoomType::Ip,
                room_id: LOOPBACK_ROOM.to_string(),
            }),
        ]);

        let joined = node.info();
        for other in &mut self.nodes {
            other
                .inbox
                .push_back(ServerEvent::Message(ServerMessage::PeerJoined {
                    peer: joined.clone(),
                    room_type: RoomType::Ip,
                    room_id: LOOPBACK_ROOM.to_string(),
                }));
        }

        tracing::info!("Loopback node {} joined as {}", id, node.display_name);
        self.nodes.push(node);
        Ok(id)
    }

    /// Queue a command for `node`
    pub fn command(&mut self, node: &PeerId, command: Command) -> Result<()> {
        let node = self
            .node_mut(node)
            .ok_or_else(|| LoopbackError::UnknownNode(node.clone()))?;
        node.commands.push_back(command);
        Ok(())
    }

    /// Announce `node` to the rest of the room again, as the server does
    /// when it rejoins
    pub fn reannounce(&mut self, node: &PeerId) -> Result<()> {
        let peer = self
            .node(node)
            .map(Node::info)
            .ok_or_else(|| LoopbackError::UnknownNode(node.clone()))?;
        for other in self.nodes.iter_mut().filter(|n| &n.id != node) {
            other
                .inbox
                .push_back(ServerEvent::Message(ServerMessage::PeerJoined {
                    peer: peer.clone(),
                    room_type: RoomType::Ip,
                    room_id: LOOPBACK_ROOM.to_string(),
                }));
        }
        Ok(())
    }

    /// Cut `node` off the signaling server; the rest of the room sees it leave
    pub fn disconnect_server(&mut self, node: &PeerId) -> Result<()> {
        let target = self
            .node_mut(node)
            .ok_or_else(|| LoopbackError::UnknownNode(node.clone()))?;
        target.server.set_connected(false);
        target.inbox.push_back(ServerEvent::Disconnected);

        for other in self.nodes.iter_mut().filter(|n| &n.id != node) {
            other
                .inbox
                .push_back(ServerEvent::Message(ServerMessage::PeerLeft {
                    peer_id: node.clone(),
                    room_type: Some(RoomType::Ip),
                    room_id: Some(LOOPBACK_ROOM.to_string()),
                    disconnect: true,
                }));
        }
        Ok(())
    }

    /// Forward what nodes handed to the server
    fn route(&mut self) -> usize {
        let mut outgoing = Vec::new();
        for node in &mut self.nodes {
            while let Ok(msg) = node.server_rx.try_recv() {
                outgoing.push((node.id.clone(), msg));
            }
        }

        let routed = outgoing.len();
        for (from, msg) in outgoing {
            let sender = SenderRef { id: from.clone() };
            match msg {
                ClientMessage::Signal(signal) => {
                    let Some(target) = self.node_mut(&signal.to) else {
                        tracing::debug!("Dropping signal to unknown node {}", signal.to);
                        continue;
                    };
                    target
                        .inbox
                        .push_back(ServerEvent::Message(ServerMessage::Signal(InboundSignal {
                            sender,
                            signal: signal.signal,
                        })));
                }
                ClientMessage::WsRelay(relay) => {
                    let Some(target) = self.node_mut(&relay.to) else {
                        tracing::debug!("Dropping relay message to unknown node {}", relay.to);
                        continue;
                    };
                    target.record(&from, &relay.message);
                    target
                        .inbox
                        .push_back(ServerEvent::Message(ServerMessage::WsRelay(InboundRelay {
                            sender,
                            message: relay.message,
                        })));
                }
                ClientMessage::RegenerateRoomSecret { .. } => {
                    tracing::debug!("{} asked to regenerate a room secret", from);
                }
                ClientMessage::Pong => {}
            }
        }
        routed
    }

    /// Route server traffic, let every node handle its inputs, then move
    /// one data chunk per direct link. Returns how much happened.
    pub async fn step(&mut self) -> usize {
        self.rounds += 1;
        let mut progress = self.route();
        for node in &mut self.nodes {
            progress += node.step().await;
        }
        progress + self.network.deliver(1)
    }

    /// Step until nothing is left to do
    pub async fn settle(&mut self) -> Result<()> {
        for _ in 0..MAX_ROUNDS {
            if self.step().await == 0 {
                return Ok(());
            }
        }
        Err(LoopbackError::RoundLimit { rounds: MAX_ROUNDS })
    }

    /// Step until `done` holds
    pub async fn run_until(&mut self, mut done: impl FnMut(&Loopback) -> bool) -> Result<()> {
        for round in 0..MAX_ROUNDS {
            if done(self) {
                return Ok(());
            }
            if self.step().await == 0 && !done(self) {
                return Err(LoopbackError::Stalled { rounds: round + 1 });
            }
        }
        Err(LoopbackError::RoundLimit { rounds: MAX_ROUNDS })
    }
}

fn generate_node_id() -> Result<PeerId> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).map_err(|e| LoopbackError::Random(e.to_string()))?;
    Ok(PeerId::new(hex::encode(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(lb: &Loopback, a: &PeerId, b: &PeerId) -> bool {
        let stable = |x: &PeerId, y: &PeerId| {
            lb.node(x)
                .and_then(|n| n.registry().peer(y))
                .map(|s| s.is_stable())
                .unwrap_or(false)
        };
        stable(a, b) && stable(b, a)
    }

    #[tokio::test]
    async fn test_nodes_connect_directly() {
        let mut lb = Loopback::new(false);
        let a = lb.add_node(true, TransferSettings::default(), None).unwrap();
        let b = lb.add_node(true, TransferSettings::default(), None).unwrap();

        lb.run_until(|lb| connected(lb, &a, &b)).await.unwrap();
        assert!(lb.network().is_linked(&a, &b));
        assert!(lb.node(&a).unwrap().registry().peer(&b).unwrap().is_direct());

        // Both ends derive the same pairing code
        lb.settle().await.unwrap();
        let hash_of = |node: &PeerId| {
            lb.node(node).unwrap().events().iter().find_map(|e| match e {
                PeerEvent::PeerConnected { connection_hash, .. } => Some(connection_hash.clone()),
                _ => None,
            })
        };
        let hash = hash_of(&a).unwrap();
        assert!(!hash.is_empty());
        assert_eq!(Some(hash), hash_of(&b));
    }

    #[tokio::test]
    async fn test_display_names_are_exchanged() {
        let mut lb = Loopback::new(true);
        let a = lb.add_node(true, TransferSettings::default(), None).unwrap();
        let b = lb.add_node(false, TransferSettings::default(), None).unwrap();
        lb.run_until(|lb| connected(lb, &a, &b)).await.unwrap();
        lb.settle().await.unwrap();

        let session = lb.node(&a).unwrap().registry().peer(&b).unwrap();
        assert!(!session.is_direct());
        assert_eq!(session.display_name(), Some("Node 2"));
    }

    #[tokio::test]
    async fn test_configured_display_name_reaches_peer() {
        let mut lb = Loopback::new(true);
        let a = lb.add_node(false, TransferSettings::default(), None).unwrap();
        let b = lb.add_node(false, TransferSettings::default(), None).unwrap();
        lb.run_until(|lb| connected(lb, &a, &b)).await.unwrap();

        lb.command(&a, Command::SetDisplayName(Some("Blue Otter".to_string())))
            .unwrap();
        lb.settle().await.unwrap();

        let session = lb.node(&b).unwrap().registry().peer(&a).unwrap();
        assert_eq!(session.display_name(), Some("Blue Otter"));
    }

    #[tokio::test]
    async fn test_unknown_node_command() {
        let mut lb = Loopback::new(false);
        let err = lb
            .command(&PeerId::new("nobody"), Command::DisconnectPeer(PeerId::new("x")))
            .unwrap_err();
        assert!(matches!(err, LoopbackError::UnknownNode(_)));
    }

    #[tokio::test]
    async fn test_server_disconnect_drops_relayed_peer() {
        let mut lb = Loopback::new(true);
        let a = lb.add_node(false, TransferSettings::default(), None).unwrap();
        let b = lb.add_node(false, TransferSettings::default(), None).unwrap();
        lb.run_until(|lb| connected(lb, &a, &b)).await.unwrap();

        lb.disconnect_server(&a).unwrap();
        lb.settle().await.unwrap();
        assert!(lb.node(&a).unwrap().registry().is_empty());
        assert!(lb.node(&b).unwrap().registry().is_empty());
    }
}
