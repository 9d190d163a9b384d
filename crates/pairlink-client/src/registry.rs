//! Peer registry and router
//!
//! The registry owns every [`PeerSession`], keyed by peer id. It creates
//! sessions when the signaling server announces peers, routes signals,
//! relayed messages and direct connection events to the addressed session,
//! and tears sessions down when their last room membership goes away.
//!
//! All inputs are handled one at a time on a single task, so sessions need
//! no locking.

use crate::events::PeerEvent;
use crate::session::direct::DirectLink;
use crate::session::link::Link;
use crate::session::relay::RelayLink;
use crate::session::rooms::Rooms;
use crate::session::{Flow, PeerSession, SessionContext};
use pairlink_core::proto::{ClientMessage, PeerInfo, ServerMessage, WsConfig};
use pairlink_core::{ConnectionFactory, DirectSignal, OutgoingFile, PeerId, RoomType};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle and traffic of the signaling transport
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connected,
    Disconnected,
    Message(ServerMessage),
}

/// Requests from the UI and the pairing storage
#[derive(Debug, Clone)]
pub enum Command {
    FilesSelected {
        to: PeerId,
        files: Vec<OutgoingFile>,
        thumbnail_data_url: Option<String>,
    },
    RespondToTransferRequest {
        to: PeerId,
        accepted: bool,
    },
    SendText {
        to: PeerId,
        text: String,
    },
    /// Override our display name; `None` restores the server-assigned one
    SetDisplayName(Option<String>),
    SetAutoAccept {
        room_secret: String,
        auto_accept: bool,
    },
    /// The peer runs on this device
    MarkSameDevice(PeerId),
    RoomSecretsDeleted(Vec<String>),
    LeavePublicRoom(String),
    DisconnectPeer(PeerId),
}

#[derive(Debug)]
pub enum Input {
    Server(ServerEvent),
    Direct(DirectSignal),
    Command(Command),
}

pub struct Registry {
    peers: HashMap<PeerId, PeerSession>,
    ctx: SessionContext,
    factory: Arc<dyn ConnectionFactory>,
    direct_tx: mpsc::UnboundedSender<DirectSignal>,
    /// Whether this endpoint can open direct connections
    rtc_supported: bool,
    ws_config: WsConfig,
    display_name: Option<String>,
    original_display_name: Option<String>,
    same_device: HashSet<PeerId>,
    auto_accept: HashMap<String, bool>,
}

fn auto_accept_for(table: &HashMap<String, bool>, rooms: &Rooms) -> bool {
    rooms
        .secret()
        .and_then(|secret| table.get(secret))
        .copied()
        .unwrap_or(false)
}

impl Registry {
    /// Create a registry. Events of the direct connections it opens arrive
    /// on the returned receiver and must be fed back as [`Input::Direct`].
    pub fn new(
        ctx: SessionContext,
        factory: Arc<dyn ConnectionFactory>,
        rtc_supported: bool,
    ) -> (Self, mpsc::UnboundedReceiver<DirectSignal>) {
        let (direct_tx, direct_rx) = mpsc::unbounded_channel();
        let registry = Self {
            peers: HashMap::new(),
            ctx,
            factory,
            direct_tx,
            rtc_supported,
            ws_config: WsConfig::default(),
            display_name: None,
            original_display_name: None,
            same_device: HashSet::new(),
            auto_accept: HashMap::new(),
        };
        (registry, direct_rx)
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<&PeerSession> {
        self.peers.get(peer_id)
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.keys()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Handle inputs until the server or command channel closes
    pub async fn run(
        mut self,
        mut server_rx: mpsc::UnboundedReceiver<ServerEvent>,
        mut direct_rx: mpsc::UnboundedReceiver<DirectSignal>,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
    ) {
        tracing::info!("Peer registry started");
        loop {
            // Connection events first: a refresh must not race signals for the new connection
            let input = tokio::select! {
                biased;
                Some(signal) = direct_rx.recv() => Input::Direct(signal),
                event = server_rx.recv() => match event {
                    Some(event) => Input::Server(event),
                    None => break,
                },
                command = command_rx.recv() => match command {
                    Some(command) => Input::Command(command),
                    None => break,
                },
            };
            self.handle(input).await;
        }
        tracing::info!("Peer registry stopped with {} sessions", self.peers.len());
    }

    pub async fn handle(&mut self, input: Input) {
        match input {
            Input::Server(event) => self.on_server_event(event).await,
            Input::Direct(signal) => self.on_direct_signal(signal).await,
            Input::Command(command) => self.on_command(command).await,
        }
    }

    async fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected => tracing::info!("Signaling transport connected"),
            ServerEvent::Disconnected => self.on_ws_disconnected(),
            ServerEvent::Message(message) => self.on_server_message(message).await,
        }
    }

    async fn on_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::WsConfig { ws_config } => {
                tracing::debug!("Relay fallback {}", if ws_config.ws_fallback { "enabled" } else { "disabled" });
                self.ws_config = ws_config;
            }
            ServerMessage::Peers {
                peers,
                room_type,
                room_id,
            } => {
                for peer in peers {
                    self.create_or_refresh(true, peer, room_type, &room_id).await;
                }
            }
            ServerMessage::PeerJoined {
                peer,
                room_type,
                room_id,
            } => self.create_or_refresh(false, peer, room_type, &room_id).await,
            ServerMessage::PeerLeft {
                peer_id,
                room_type,
                disconnect,
                ..
            } => {
                tracing::debug!("Peer {} left", peer_id);
                if disconnect {
                    self.remove_room_type_by_peer(&peer_id, room_type);
                }
            }
            ServerMessage::Signal(inbound) => {
                let Some(session) = self.peers.get_mut(&inbound.sender.id) else {
                    tracing::warn!("Signal from unknown peer {}", inbound.sender.id);
                    return;
                };
                let flow = session.on_signal(inbound.signal).await;
                if flow == Flow::Connected {
                    session.send_display_name(self.display_name.as_deref());
                }
            }
            ServerMessage::WsRelay(inbound) => {
                if !self.ws_config.ws_fallback {
                    tracing::debug!("Ignoring relayed message, relay fallback is disabled");
                    return;
                }
                let Some(session) = self.peers.get_mut(&inbound.sender.id) else {
                    tracing::debug!("Relayed message from unknown peer {}", inbound.sender.id);
                    return;
                };
                if session.is_direct() {
                    return;
                }
                let flow = session.on_relay(inbound.message).await;
                if flow == Flow::Connected {
                    session.send_display_name(self.display_name.as_deref());
                }
            }
            ServerMessage::DisplayName { display_name } => {
                tracing::info!("Server assigned display name {}", display_name);
                if self.display_name.is_none() {
                    self.display_name = Some(display_name.clone());
                }
                self.original_display_name = Some(display_name);
            }
            ServerMessage::SecretRoomDeleted { room_secret } => {
                self.remove_room_type_by_room_id(RoomType::Secret, &room_secret);
            }
            ServerMessage::Ping => self.ctx.server.send(ClientMessage::Pong),
            ServerMessage::Unknown => tracing::warn!("Unknown message from signaling server"),
        }
    }

    async fn on_direct_signal(&mut self, signal: DirectSignal) {
        let Some(session) = self.peers.get_mut(&signal.peer_id) else {
            tracing::trace!("Direct event for unknown peer {}", signal.peer_id);
            return;
        };
        let flow = session.on_direct_event(signal).await;
        if flow == Flow::Connected {
            session.send_display_name(self.display_name.as_deref());
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::FilesSelected {
                to,
                files,
                thumbnail_data_url,
            } => match self.peers.get_mut(&to) {
                Some(session) => session.request_file_transfer(files, thumbnail_data_url),
                None => tracing::warn!("Cannot send files to unknown peer {}", to),
            },
            Command::RespondToTransferRequest { to, accepted } => match self.peers.get_mut(&to) {
                Some(session) => session.respond_to_transfer_request(accepted),
                None => tracing::warn!("Cannot respond to unknown peer {}", to),
            },
            Command::SendText { to, text } => match self.peers.get_mut(&to) {
                Some(session) => session.send_text(&text),
                None => tracing::warn!("Cannot send text to unknown peer {}", to),
            },
            Command::SetDisplayName(display_name) => {
                self.display_name = display_name.or_else(|| self.original_display_name.clone());
                for session in self.peers.values_mut() {
                    session.send_display_name(self.display_name.as_deref());
                }
            }
            Command::SetAutoAccept {
                room_secret,
                auto_accept,
            } => {
                for session in self.peers.values_mut() {
                    if session.rooms().secret() == Some(room_secret.as_str()) {
                        session.set_auto_accept(auto_accept);
                    }
                }
                self.auto_accept.insert(room_secret, auto_accept);
            }
            Command::MarkSameDevice(peer_id) => {
                if let Some(session) = self.peers.get_mut(&peer_id) {
                    session.set_same_device(true);
                }
                self.same_device.insert(peer_id);
            }
            Command::RoomSecretsDeleted(secrets) => {
                for secret in secrets {
                    self.auto_accept.remove(&secret);
                    self.remove_room_type_by_room_id(RoomType::Secret, &secret);
                }
            }
            Command::LeavePublicRoom(room_id) => {
                self.remove_room_type_by_room_id(RoomType::PublicId, &room_id);
            }
            Command::DisconnectPeer(peer_id) => self.destroy(&peer_id),
        }
    }

    async fn create_or_refresh(&mut self, is_caller: bool, peer: PeerInfo, room_type: RoomType, room_id: &str) {
        let Some(session) = self.peers.get_mut(&peer.id) else {
            self.create(is_caller, peer, room_type, room_id).await;
            return;
        };

        let room_types_differ = session.rooms().first().map(|(t, _)| t) != Some(room_type);
        let room_ids_differ = session.rooms().get(room_type) != Some(room_id);

        // Already connected through another room: only the memberships change
        if room_types_differ || room_ids_differ {
            session.update_rooms(room_type, room_id);
            let auto_accept = auto_accept_for(&self.auto_accept, session.rooms());
            session.set_auto_accept(auto_accept);
            return;
        }

        // Same room again: keep an established link unless the roles switched
        if session.is_stable() && session.is_caller() == is_caller {
            tracing::debug!("{} announced again, link kept", peer.id);
            return;
        }
        session.refresh(is_caller).await;
    }

    async fn create(&mut self, is_caller: bool, peer: PeerInfo, room_type: RoomType, room_id: &str) {
        let link = if self.rtc_supported && peer.rtc_supported {
            Link::Direct(DirectLink::new(
                peer.id.clone(),
                self.factory.clone(),
                self.ws_config.rtc_config.clone(),
                self.direct_tx.clone(),
                self.ctx.settings.direct_low_watermark,
            ))
        } else if self.ws_config.ws_fallback {
            Link::Relay(RelayLink::new())
        } else {
            tracing::warn!(
                "Cannot connect to {}: no direct connection possible and relay fallback is disabled",
                peer.id
            );
            return;
        };

        tracing::info!(
            "New {} session with {} via {:?} room",
            if link.is_direct() { "direct" } else { "relayed" },
            peer.id,
            room_type
        );
        let mut session = PeerSession::new(
            peer.id.clone(),
            is_caller,
            room_type,
            room_id,
            link,
            self.ctx.clone(),
            self.same_device.contains(&peer.id),
        );
        session.set_auto_accept(auto_accept_for(&self.auto_accept, session.rooms()));
        session.start().await;
        self.peers.insert(peer.id, session);
    }

    fn on_ws_disconnected(&mut self) {
        tracing::info!("Signaling transport disconnected");
        let relayed: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, session)| !session.is_direct())
            .map(|(id, _)| id.clone())
            .collect();
        for peer_id in relayed {
            self.destroy(&peer_id);
        }
    }

    fn remove_room_type_by_room_id(&mut self, room_type: RoomType, room_id: &str) {
        let peer_ids: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, session)| session.rooms().contains_id(room_id))
            .map(|(id, _)| id.clone())
            .collect();
        for peer_id in peer_ids {
            self.remove_room_type_by_peer(&peer_id, Some(room_type));
        }
    }

    /// Drop one membership, or the whole session if it is the last one
    fn remove_room_type_by_peer(&mut self, peer_id: &PeerId, room_type: Option<RoomType>) {
        let Some(session) = self.peers.get_mut(peer_id) else {
            return;
        };
        match room_type {
            Some(room_type) if session.rooms().len() > 1 => session.remove_room_type(room_type),
            _ => self.destroy(peer_id),
        }
    }

    fn destroy(&mut self, peer_id: &PeerId) {
        let Some(mut session) = self.peers.remove(peer_id) else {
            return;
        };
        session.disconnect();
        self.ctx.events.emit(PeerEvent::PeerDisconnected {
            peer_id: peer_id.clone(),
        });
    }
}
