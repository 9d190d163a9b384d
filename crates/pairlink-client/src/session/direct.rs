//! Direct connection negotiation
//!
//! The caller creates the offer, the other side answers. Signals that
//! arrive before a connection object exists are queued and replayed in
//! order once one is opened; protocol messages sent before both channels
//! are open are queued and flushed in order once the link is stable.
//! Any transport failure tears the connection down and negotiates a new
//! one. Every connection gets a fresh generation number so that events
//! still in flight from a torn-down connection can be dropped.

use super::link::{LinkEvent, Outbox};
use crate::events::{EventSink, PeerEvent};
use bytes::Bytes;
use pairlink_core::proto::{IceCandidate, Message, RtcConfig, SessionDescription, SignalBody, SignalMessage};
use pairlink_core::transport::{Channel, ChannelState, ConnectionState};
use pairlink_core::{
    ConnectionFactory, DirectConnection, DirectEvent, DirectEventSink, DirectSignal, Error, PeerId, Result,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection generations are unique per process
static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

pub struct DirectLink {
    peer_id: PeerId,
    factory: Arc<dyn ConnectionFactory>,
    rtc_config: RtcConfig,
    direct_tx: mpsc::UnboundedSender<DirectSignal>,
    low_watermark: u64,

    conn: Option<Box<dyn DirectConnection>>,
    generation: u64,
    announced: bool,
    local_candidates_done: bool,
    remote_candidates_done: bool,

    pending_inbound: VecDeque<SignalBody>,
    pending_outbound: VecDeque<String>,
}

impl DirectLink {
    pub fn new(
        peer_id: PeerId,
        factory: Arc<dyn ConnectionFactory>,
        rtc_config: RtcConfig,
        direct_tx: mpsc::UnboundedSender<DirectSignal>,
        low_watermark: u64,
    ) -> Self {
        Self {
            peer_id,
            factory,
            rtc_config,
            direct_tx,
            low_watermark,
            conn: None,
            generation: 0,
            announced: false,
            local_candidates_done: false,
            remote_candidates_done: false,
            pending_inbound: VecDeque::new(),
            pending_outbound: VecDeque::new(),
        }
    }

    /// Connected with both channels open
    pub fn is_stable(&self) -> bool {
        match &self.conn {
            Some(conn) => {
                conn.connection_state() == ConnectionState::Connected
                    && conn.channel_state(Channel::Control) == ChannelState::Open
                    && conn.channel_state(Channel::Data) == ChannelState::Open
            }
            None => false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_outbound(&self) -> usize {
        self.pending_outbound.len()
    }

    pub fn max_message_size(&self) -> Option<u64> {
        self.conn.as_ref().and_then(|c| c.max_message_size())
    }

    pub fn buffered_amount(&self) -> u64 {
        self.conn.as_ref().map(|c| c.buffered_amount()).unwrap_or(0)
    }

    /// Open a connection unless the link is already stable
    pub async fn connect(&mut self, is_caller: bool, out: &Outbox<'_>, events: &EventSink) {
        if self.is_stable() {
            return;
        }
        events.emit(PeerEvent::PeerConnecting {
            peer_id: self.peer_id.clone(),
        });

        self.open_connection();
        self.evaluate_pending_inbound(is_caller, out).await;
    }

    /// Tear down the connection and negotiate a new one
    pub async fn refresh(&mut self, is_caller: bool, out: &Outbox<'_>, events: &EventSink) {
        tracing::debug!("Refreshing direct link to {}", self.peer_id);
        self.close();
        self.connect(is_caller, out, events).await;
    }

    pub fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
        self.announced = false;
        self.local_candidates_done = false;
        self.remote_candidates_done = false;
    }

    fn open_connection(&mut self) {
        self.close();

        let generation = NEXT_GENERATION.fetch_add(1, Ordering::SeqCst);
        self.generation = generation;
        let sink = DirectEventSink::new(self.peer_id.clone(), generation, self.direct_tx.clone());

        match self.factory.connect(&self.peer_id, &self.rtc_config, sink) {
            Ok(mut conn) => {
                conn.set_buffered_amount_low_threshold(self.low_watermark);
                self.conn = Some(conn);
            }
            Err(e) => {
                tracing::warn!("Could not open direct connection to {}: {}", self.peer_id, e);
            }
        }
    }

    async fn evaluate_pending_inbound(&mut self, is_caller: bool, out: &Outbox<'_>) {
        let mut evaluated = 0;
        while self.conn.is_some() {
            let Some(body) = self.pending_inbound.pop_front() else {
                break;
            };
            if let Err(e) = self.apply_signal(body, is_caller, out).await {
                tracing::warn!("Queued signal from {} failed: {}", self.peer_id, e);
            }
            evaluated += 1;
        }
        if evaluated > 0 {
            tracing::debug!("Evaluated {} pending signals from {}", evaluated, self.peer_id);
        }
    }

    /// Handle a signal relayed by the server
    pub async fn on_signal(
        &mut self,
        signal: SignalMessage,
        is_caller: bool,
        out: &Outbox<'_>,
        events: &EventSink,
    ) {
        let body = signal.into_body();
        if self.conn.is_none() {
            self.pending_inbound.push_back(body);
            return;
        }

        if let Err(e) = self.apply_signal(body, is_caller, out).await {
            tracing::warn!("Negotiation with {} failed: {}", self.peer_id, e);
            self.refresh(is_caller, out, events).await;
        }
    }

    async fn apply_signal(&mut self, body: SignalBody, is_caller: bool, out: &Outbox<'_>) -> Result<()> {
        match body {
            SignalBody::Description(description) => {
                self.handle_remote_description(description, is_caller, out).await
            }
            SignalBody::Candidate(candidate) => self.handle_remote_candidate(candidate).await,
            other => {
                tracing::warn!("Unexpected signal from {}: {:?}", self.peer_id, other);
                Ok(())
            }
        }
    }

    fn conn_mut(&mut self) -> Result<&mut Box<dyn DirectConnection>> {
        self.conn
            .as_mut()
            .ok_or_else(|| Error::Negotiation("no connection".to_string()))
    }

    async fn handle_remote_description(
        &mut self,
        description: SessionDescription,
        is_caller: bool,
        out: &Outbox<'_>,
    ) -> Result<()> {
        tracing::debug!("Received remote description from {}", self.peer_id);
        self.conn_mut()?.set_remote_description(description).await?;

        if !is_caller {
            tracing::debug!("Creating answer for {}", self.peer_id);
            let answer = self.conn_mut()?.create_answer().await?;
            self.handle_local_description(answer, out).await?;
        }
        Ok(())
    }

    async fn handle_local_description(&mut self, description: SessionDescription, out: &Outbox<'_>) -> Result<()> {
        self.conn_mut()?.set_local_description(description.clone()).await?;
        tracing::debug!("Sending local description to {}", self.peer_id);
        out.signal(SignalMessage::description(description));
        Ok(())
    }

    async fn handle_remote_candidate(&mut self, candidate: Option<IceCandidate>) -> Result<()> {
        if self.remote_candidates_done {
            return Ok(());
        }
        match candidate {
            Some(candidate) => self.conn_mut()?.add_ice_candidate(candidate).await,
            None => {
                self.remote_candidates_done = true;
                Ok(())
            }
        }
    }

    fn handle_local_candidate(&mut self, candidate: Option<IceCandidate>, out: &Outbox<'_>) {
        if self.local_candidates_done {
            return;
        }
        if candidate.is_none() {
            self.local_candidates_done = true;
        }
        out.signal(SignalMessage::candidate(candidate));
    }

    async fn create_offer(&mut self, out: &Outbox<'_>) -> Result<()> {
        tracing::debug!("Creating offer for {}", self.peer_id);
        let offer = self.conn_mut()?.create_offer().await?;
        self.handle_local_description(offer, out).await
    }

    /// Handle an event of the underlying connection
    pub async fn on_event(
        &mut self,
        signal: DirectSignal,
        is_caller: bool,
        out: &Outbox<'_>,
        events: &EventSink,
    ) -> Option<LinkEvent> {
        if signal.generation != self.generation || self.conn.is_none() {
            tracing::trace!("Dropping event of stale connection to {}", self.peer_id);
            return None;
        }

        match signal.event {
            DirectEvent::NegotiationNeeded => {
                if is_caller {
                    if let Err(e) = self.create_offer(out).await {
                        tracing::warn!("Creating offer for {} failed: {}", self.peer_id, e);
                        self.refresh(is_caller, out, events).await;
                    }
                }
                None
            }
            DirectEvent::LocalCandidate(candidate) => {
                self.handle_local_candidate(candidate, out);
                None
            }
            DirectEvent::ConnectionStateChanged(state) => {
                tracing::debug!("Connection to {} is {:?}", self.peer_id, state);
                match state {
                    ConnectionState::Disconnected => self.refresh(is_caller, out, events).await,
                    ConnectionState::Failed => {
                        tracing::warn!("Direct connection to {} failed", self.peer_id);
                        self.refresh(is_caller, out, events).await;
                    }
                    _ => {}
                }
                None
            }
            DirectEvent::ChannelOpened(channel) => {
                tracing::debug!("{:?} channel to {} opened", channel, self.peer_id);
                if self.announced || !self.is_stable() {
                    return None;
                }
                self.announced = true;
                self.flush_pending_outbound();
                Some(LinkEvent::Stabilized)
            }
            DirectEvent::ChannelClosed(channel) => {
                tracing::debug!("{:?} channel to {} closed", channel, self.peer_id);
                self.refresh(is_caller, out, events).await;
                None
            }
            DirectEvent::ChannelError(channel, error) => {
                tracing::warn!("{:?} channel to {} errored: {}", channel, self.peer_id, error);
                None
            }
            DirectEvent::ControlMessage(text) => match Message::from_json(&text) {
                Ok(message) => Some(LinkEvent::Message(message)),
                Err(e) => {
                    tracing::warn!("Malformed message from {}: {}", self.peer_id, e);
                    None
                }
            },
            DirectEvent::Data(data) => Some(LinkEvent::Data(data)),
            DirectEvent::BufferedAmountLow => Some(LinkEvent::Drained),
        }
    }

    /// Send on the control channel, queueing while the link is not stable
    /// or older messages are still queued
    pub fn send_message(&mut self, message: &Message) {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Could not encode {} message: {}", message.kind(), e);
                return;
            }
        };
        tracing::debug!("Direct send to {}: {}", self.peer_id, message.kind());

        if !self.is_stable() || !self.pending_outbound.is_empty() {
            self.pending_outbound.push_back(text);
            return;
        }
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = conn.send_text(&text) {
                tracing::warn!("Control channel send to {} failed, queueing: {}", self.peer_id, e);
                self.pending_outbound.push_back(text);
            }
        }
    }

    fn flush_pending_outbound(&mut self) {
        while self.is_stable() {
            let Some(text) = self.pending_outbound.pop_front() else {
                break;
            };
            let Some(conn) = self.conn.as_mut() else {
                self.pending_outbound.push_front(text);
                break;
            };
            if let Err(e) = conn.send_text(&text) {
                tracing::warn!("Flushing queued messages to {} failed: {}", self.peer_id, e);
                self.pending_outbound.push_front(text);
                break;
            }
        }
    }

    /// Send file bytes on the data channel
    pub fn send_data(&mut self, data: Bytes) -> Result<()> {
        match self.conn.as_mut() {
            Some(conn) => conn.send_binary(data),
            None => Err(Error::ChannelClosed(format!("no connection to {}", self.peer_id))),
        }
    }

    /// Pairing code derived from both transport fingerprints, identical on
    /// both sides of the connection
    pub fn connection_hash(&self, is_caller: bool) -> String {
        let Some(conn) = &self.conn else {
            return String::new();
        };
        let fingerprint = |d: Option<SessionDescription>| {
            d.and_then(|d| d.fingerprint().map(str::to_string))
                .unwrap_or_default()
        };
        let local = fingerprint(conn.local_description());
        let remote = fingerprint(conn.remote_description());

        let combined = if is_caller {
            local + &remote
        } else {
            remote + &local
        };
        fingerprint_hash(&combined)
    }
}

/// 53-bit digest of `combined`, as a zero-padded 16 digit decimal
pub fn fingerprint_hash(combined: &str) -> String {
    let digest = blake3::hash(combined.as_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.as_bytes()[..8]);
    let value = u64::from_le_bytes(word) & ((1u64 << 53) - 1);
    format!("{:016}", value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairlink_core::proto::ClientMessage;
    use pairlink_core::transport::mock::{MockConnectionFactory, MockDirectNetwork};
    use pairlink_core::{RoomType, ServerConnection};
    use std::sync::Mutex;
    use crate::session::rooms::Route;

    fn route(remote: &PeerId) -> Option<Route> {
        Some(Route {
            to: remote.clone(),
            room_type: RoomType::Ip,
            room_id: "127.0.0.1".to_string(),
        })
    }

    struct Side {
        link: DirectLink,
        server: ServerConnection,
        server_rx: mpsc::UnboundedReceiver<ClientMessage>,
        direct_rx: mpsc::UnboundedReceiver<DirectSignal>,
        events: EventSink,
        remote: PeerId,
        is_caller: bool,
    }

    impl Side {
        fn new(network: &MockDirectNetwork, local: &str, remote: &str, is_caller: bool) -> Self {
            let factory = Arc::new(network.factory(PeerId::new(local)));
            Self::with_factory(factory, remote, is_caller)
        }

        fn with_factory(factory: Arc<dyn ConnectionFactory>, remote: &str, is_caller: bool) -> Self {
            let (server, server_rx) = ServerConnection::channel();
            server.set_connected(true);
            let (direct_tx, direct_rx) = mpsc::unbounded_channel();
            let (events, _events_rx) = EventSink::channel();
            Self {
                link: DirectLink::new(PeerId::new(remote), factory, RtcConfig::default(), direct_tx, 0),
                server,
                server_rx,
                direct_rx,
                events,
                remote: PeerId::new(remote),
                is_caller,
            }
        }

        /// Handle queued connection events, returning what surfaced
        async fn pump_events(&mut self) -> Vec<LinkEvent> {
            let mut surfaced = Vec::new();
            while let Ok(signal) = self.direct_rx.try_recv() {
                let out = Outbox::new(&self.server, route(&self.remote));
                if let Some(event) = self.link.on_event(signal, self.is_caller, &out, &self.events).await {
                    surfaced.push(event);
                }
            }
            surfaced
        }

        async fn connect(&mut self) {
            let out = Outbox::new(&self.server, route(&self.remote));
            self.link.connect(self.is_caller, &out, &self.events).await;
        }

        async fn on_signal(&mut self, signal: SignalMessage) {
            let out = Outbox::new(&self.server, route(&self.remote));
            self.link.on_signal(signal, self.is_caller, &out, &self.events).await;
        }

        fn outgoing_signals(&mut self) -> Vec<SignalMessage> {
            let mut signals = Vec::new();
            while let Ok(msg) = self.server_rx.try_recv() {
                if let ClientMessage::Signal(signal) = msg {
                    signals.push(signal.signal);
                }
            }
            signals
        }
    }

    /// Mock connections that remember every remote candidate they were given
    struct RecordingFactory {
        inner: MockConnectionFactory,
        added: Arc<Mutex<Vec<IceCandidate>>>,
    }

    impl ConnectionFactory for RecordingFactory {
        fn connect(
            &self,
            peer_id: &PeerId,
            config: &RtcConfig,
            events: DirectEventSink,
        ) -> Result<Box<dyn DirectConnection>> {
            Ok(Box::new(RecordingConnection {
                inner: self.inner.connect(peer_id, config, events)?,
                added: self.added.clone(),
            }))
        }
    }

    struct RecordingConnection {
        inner: Box<dyn DirectConnection>,
        added: Arc<Mutex<Vec<IceCandidate>>>,
    }

    #[async_trait::async_trait]
    impl DirectConnection for RecordingConnection {
        async fn create_offer(&mut self) -> Result<SessionDescription> {
            self.inner.create_offer().await
        }

        async fn create_answer(&mut self) -> Result<SessionDescription> {
            self.inner.create_answer().await
        }

        async fn set_local_description(&mut self, description: SessionDescription) -> Result<()> {
            self.inner.set_local_description(description).await
        }

        async fn set_remote_description(&mut self, description: SessionDescription) -> Result<()> {
            self.inner.set_remote_description(description).await
        }

        async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
            self.added.lock().unwrap().push(candidate.clone());
            self.inner.add_ice_candidate(candidate).await
        }

        fn local_description(&self) -> Option<SessionDescription> {
            self.inner.local_description()
        }

        fn remote_description(&self) -> Option<SessionDescription> {
            self.inner.remote_description()
        }

        fn connection_state(&self) -> ConnectionState {
            self.inner.connection_state()
        }

        fn channel_state(&self, channel: Channel) -> ChannelState {
            self.inner.channel_state(channel)
        }

        fn send_text(&mut self, text: &str) -> Result<()> {
            self.inner.send_text(text)
        }

        fn send_binary(&mut self, data: Bytes) -> Result<()> {
            self.inner.send_binary(data)
        }

        fn buffered_amount(&self) -> u64 {
            self.inner.buffered_amount()
        }

        fn set_buffered_amount_low_threshold(&mut self, threshold: u64) {
            self.inner.set_buffered_amount_low_threshold(threshold)
        }

        fn max_message_size(&self) -> Option<u64> {
            self.inner.max_message_size()
        }

        fn close(&mut self) {
            self.inner.close()
        }
    }

    fn late_candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:99 1 udp 1686052607 192.0.2.7 61000 typ srflx".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    async fn exchange(a: &mut Side, b: &mut Side) -> (Vec<LinkEvent>, Vec<LinkEvent>) {
        let mut a_events = Vec::new();
        let mut b_events = Vec::new();
        for _ in 0..10 {
            a_events.extend(a.pump_events().await);
            b_events.extend(b.pump_events().await);
            for signal in a.outgoing_signals() {
                b.on_signal(signal).await;
            }
            for signal in b.outgoing_signals() {
                a.on_signal(signal).await;
            }
        }
        (a_events, b_events)
    }

    #[tokio::test]
    async fn test_negotiates_and_flushes_queued_messages() {
        let network = MockDirectNetwork::new();
        let mut a = Side::new(&network, "a", "b", true);
        let mut b = Side::new(&network, "b", "a", false);

        a.connect().await;
        b.connect().await;

        a.link.send_message(&Message::TextSent);
        assert_eq!(a.link.pending_outbound(), 1);

        let (a_events, b_events) = exchange(&mut a, &mut b).await;
        assert!(a.link.is_stable());
        assert!(b.link.is_stable());
        assert_eq!(a_events.iter().filter(|e| **e == LinkEvent::Stabilized).count(), 1);
        assert!(b_events.contains(&LinkEvent::Stabilized));
        assert!(b_events.contains(&LinkEvent::Message(Message::TextSent)));
        assert_eq!(a.link.pending_outbound(), 0);

        assert_eq!(a.link.connection_hash(true), b.link.connection_hash(false));
        assert_eq!(a.link.connection_hash(true).len(), 16);
    }

    #[tokio::test]
    async fn test_signals_before_connection_are_replayed() {
        let network = MockDirectNetwork::new();
        let mut a = Side::new(&network, "a", "b", true);
        let mut b = Side::new(&network, "b", "a", false);

        a.connect().await;
        a.pump_events().await;

        // b has no connection yet: the offer waits in its queue
        for signal in a.outgoing_signals() {
            b.on_signal(signal).await;
        }
        assert!(b.link.conn.is_none());

        b.connect().await;
        exchange(&mut a, &mut b).await;
        assert!(a.link.is_stable());
    }

    #[tokio::test]
    async fn test_channel_close_renegotiates_with_new_generation() {
        let network = MockDirectNetwork::new();
        let mut a = Side::new(&network, "a", "b", true);
        let mut b = Side::new(&network, "b", "a", false);
        a.connect().await;
        b.connect().await;
        exchange(&mut a, &mut b).await;
        let first = a.link.generation();

        network.drop_link(&PeerId::new("a"), &PeerId::new("b"));
        let (a_events, _) = exchange(&mut a, &mut b).await;

        assert!(a.link.generation() > first);
        assert!(a.link.is_stable());
        assert!(a_events.contains(&LinkEvent::Stabilized));
    }

    #[tokio::test]
    async fn test_no_local_candidates_after_end_marker() {
        let network = MockDirectNetwork::new();
        let mut a = Side::new(&network, "a", "b", true);
        a.connect().await;
        a.pump_events().await;

        let candidates = |signals: &[SignalMessage]| -> Vec<Option<IceCandidate>> {
            signals
                .iter()
                .filter_map(|s| match s.clone().into_body() {
                    SignalBody::Candidate(candidate) => Some(candidate),
                    _ => None,
                })
                .collect()
        };
        let sent = candidates(&a.outgoing_signals());
        assert_eq!(sent.len(), 2);
        assert!(sent[0].is_some());
        assert!(sent[1].is_none());

        // The connection keeps gathering after it reported the end
        for event in [
            DirectEvent::LocalCandidate(Some(late_candidate())),
            DirectEvent::LocalCandidate(None),
        ] {
            let signal = DirectSignal {
                peer_id: PeerId::new("b"),
                generation: a.link.generation(),
                event,
            };
            let out = Outbox::new(&a.server, route(&a.remote));
            assert!(a.link.on_event(signal, true, &out, &a.events).await.is_none());
        }
        assert!(candidates(&a.outgoing_signals()).is_empty());
    }

    #[tokio::test]
    async fn test_remote_candidates_after_end_marker_are_ignored() {
        let network = MockDirectNetwork::new();
        let added = Arc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(RecordingFactory {
            inner: network.factory(PeerId::new("b")),
            added: added.clone(),
        });
        let mut a = Side::new(&network, "a", "b", true);
        let mut b = Side::with_factory(factory, "a", false);
        a.connect().await;
        b.connect().await;
        exchange(&mut a, &mut b).await;
        assert!(b.link.is_stable());
        assert_eq!(added.lock().unwrap().len(), 1);

        b.on_signal(SignalMessage::candidate(Some(late_candidate()))).await;
        assert_eq!(added.lock().unwrap().len(), 1);
        assert!(b.link.is_stable());

        // A new connection accepts candidates again
        let generation = b.link.generation();
        let out = Outbox::new(&b.server, route(&b.remote));
        b.link.refresh(false, &out, &b.events).await;
        assert!(b.link.generation() > generation);
        b.on_signal(SignalMessage::candidate(Some(late_candidate()))).await;
        assert_eq!(added.lock().unwrap().len(), 2);
        assert_eq!(added.lock().unwrap()[1], late_candidate());
    }

    #[test]
    fn test_fingerprint_hash_is_zero_padded() {
        let hash = fingerprint_hash("sha-256 AA:BBsha-256 CC:DD");
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(hash, fingerprint_hash("sha-256 AA:BBsha-256 CC:DD"));
    }
}
