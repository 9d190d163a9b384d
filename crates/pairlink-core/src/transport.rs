//! Transport abstraction for moving protocol messages and file bytes
//!
//! Two seams live here:
//! - [`ChunkTransport`] is what the chunker drives. Both the direct data
//!   channel and the relay-through-signaling path implement it, and both
//!   share one [`Backpressure`] contract.
//! - [`DirectConnection`] is the peer connection collaborator the direct
//!   negotiator drives (offer/answer, candidates, two ordered channels).
//!   Its events come back as [`DirectSignal`]s tagged with a connection
//!   generation, so events of a torn-down connection can be told apart.
//!
//! The `mock` module provides an in-memory direct network for tests and
//! the loopback demo.

use crate::proto::{IceCandidate, RtcConfig, SessionDescription};
use crate::types::PeerId;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// How a sender learns it may put more bytes on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Direct transport: pause while the channel buffer plus one chunk would
    /// reach `high`; the transport signals when the buffer drains below `low`
    Buffered { high: u64, low: u64 },
    /// Relayed transport: pause while more than `window` bytes are
    /// unconfirmed by the receiver; confirmations resume sending
    Confirmation { window: u64 },
}

/// Send side of a transport, as seen by the chunker
pub trait ChunkTransport {
    /// Whether bytes can be sent right now
    fn is_open(&self) -> bool;

    /// Bytes queued in the transport but not yet on the wire
    fn buffered_amount(&self) -> u64;

    /// Put one chunk on the wire
    fn send_chunk(&mut self, chunk: Bytes) -> Result<()>;
}

/// The two negotiated sub-channels of a direct connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Ordered, reliable; carries protocol messages as JSON text
    Control,
    /// Ordered, reliable; carries raw file bytes
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Something that happened on a direct connection
#[derive(Debug, Clone, PartialEq)]
pub enum DirectEvent {
    NegotiationNeeded,
    /// `None` marks the end of local candidates
    LocalCandidate(Option<IceCandidate>),
    ConnectionStateChanged(ConnectionState),
    ChannelOpened(Channel),
    ChannelClosed(Channel),
    ChannelError(Channel, String),
    ControlMessage(String),
    Data(Bytes),
    /// The data channel buffer drained below the low threshold
    BufferedAmountLow,
}

/// A [`DirectEvent`] addressed to the session that owns the connection
#[derive(Debug, Clone)]
pub struct DirectSignal {
    pub peer_id: PeerId,
    pub generation: u64,
    pub event: DirectEvent,
}

/// Where a direct connection reports its events
#[derive(Clone, Debug)]
pub struct DirectEventSink {
    peer_id: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<DirectSignal>,
}

impl DirectEventSink {
    pub fn new(peer_id: PeerId, generation: u64, tx: mpsc::UnboundedSender<DirectSignal>) -> Self {
        Self { peer_id, generation, tx }
    }

    pub fn emit(&self, event: DirectEvent) {
        let signal = DirectSignal {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        };
        if self.tx.send(signal).is_err() {
            tracing::trace!("Direct event receiver dropped");
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// A peer connection with a control and a data channel
///
/// Implementations open both channels (negotiated, ordered, reliable) when
/// created and emit [`DirectEvent::NegotiationNeeded`] once ready for an offer.
#[async_trait]
pub trait DirectConnection: Send {
    async fn create_offer(&mut self) -> Result<SessionDescription>;

    async fn create_answer(&mut self) -> Result<SessionDescription>;

    async fn set_local_description(&mut self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&mut self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<()>;

    fn local_description(&self) -> Option<SessionDescription>;

    fn remote_description(&self) -> Option<SessionDescription>;

    fn connection_state(&self) -> ConnectionState;

    fn channel_state(&self, channel: Channel) -> ChannelState;

    /// Send a protocol message on the control channel
    fn send_text(&mut self, text: &str) -> Result<()>;

    /// Send file bytes on the data channel
    fn send_binary(&mut self, data: Bytes) -> Result<()>;

    /// Bytes buffered on the data channel
    fn buffered_amount(&self) -> u64;

    /// Threshold below which [`DirectEvent::BufferedAmountLow`] fires
    fn set_buffered_amount_low_threshold(&mut self, threshold: u64);

    /// Largest message the connection accepts, if known
    fn max_message_size(&self) -> Option<u64>;

    /// Close both channels and the connection
    fn close(&mut self);
}

/// Creates direct connections for the registry
pub trait ConnectionFactory: Send + Sync {
    fn connect(
        &self,
        peer_id: &PeerId,
        config: &RtcConfig,
        events: DirectEventSink,
    ) -> Result<Box<dyn DirectConnection>>;
}


pub mod mock {
    //! In-memory direct network for testing and the loopback demo
    //!
    //! Connections created by [`MockConnectionFactory`]s sharing one
    //! [`MockDirectNetwork`] find each other by peer id. Two endpoints are
    //! connected once each one's local description is the other's remote
    //! description. Control messages are delivered immediately; data channel
    //! sends are buffered until the network is told to deliver them, which
    //! lets tests observe backpressure and drop a link mid-transfer.

    use super::*;
    use crate::proto::SdpType;
    use crate::Error;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex, MutexGuard};

    type LinkKey = (PeerId, PeerId);

    struct Endpoint {
        connection_id: u64,
        sink: DirectEventSink,
        fingerprint: String,
        local: Option<SessionDescription>,
        remote: Option<SessionDescription>,
        connected: bool,
        outbound: VecDeque<Bytes>,
        buffered: u64,
        low_threshold: u64,
    }

    impl Endpoint {
        fn discard_outbound(&mut self) {
            self.outbound.clear();
            self.buffered = 0;
        }
    }

    #[derive(Default)]
    struct Inner {
        next_connection_id: u64,
        endpoints: HashMap<LinkKey, Endpoint>,
        delivered: HashMap<LinkKey, u64>,
        max_message_size: Option<u64>,
    }

    impl Inner {
        fn try_connect(&mut self, a: &PeerId, b: &PeerId) {
            let ab = (a.clone(), b.clone());
            let ba = (b.clone(), a.clone());
            let ready = match (self.endpoints.get(&ab), self.endpoints.get(&ba)) {
                (Some(x), Some(y)) => {
                    !x.connected
                        && !y.connected
                        && x.local.is_some()
                        && x.local == y.remote
                        && y.local.is_some()
                        && y.local == x.remote
                }
                _ => false,
            };
            if !ready {
                return;
            }

            for key in [&ab, &ba] {
                if let Some(endpoint) = self.endpoints.get_mut(key) {
                    endpoint.connected = true;
                    endpoint
                        .sink
                        .emit(DirectEvent::ConnectionStateChanged(ConnectionState::Connected));
                    endpoint.sink.emit(DirectEvent::ChannelOpened(Channel::Control));
                    endpoint.sink.emit(DirectEvent::ChannelOpened(Channel::Data));
                }
            }
            tracing::debug!("Mock direct link {} <-> {} connected", a, b);
        }

        fn break_endpoint(&mut self, key: &LinkKey) {
            if let Some(endpoint) = self.endpoints.get_mut(key) {
                endpoint.discard_outbound();
                if endpoint.connected {
                    endpoint.connected = false;
                    endpoint.sink.emit(DirectEvent::ChannelClosed(Channel::Data));
                    endpoint.sink.emit(DirectEvent::ChannelClosed(Channel::Control));
                    endpoint
                        .sink
                        .emit(DirectEvent::ConnectionStateChanged(ConnectionState::Disconnected));
                }
            }
        }

        fn is_open(&self, key: &LinkKey, connection_id: u64) -> bool {
            self.endpoints
                .get(key)
                .map(|e| e.connection_id == connection_id && e.connected)
                .unwrap_or(false)
        }

        fn peer_sink(&self, key: &LinkKey) -> Option<DirectEventSink> {
            let peer_key = (key.1.clone(), key.0.clone());
            self.endpoints
                .get(&peer_key)
                .filter(|e| e.connected)
                .map(|e| e.sink.clone())
        }

        /// Move the head of `key`'s data queue to its peer
        fn deliver_one(&mut self, key: &LinkKey) -> bool {
            let Some(peer_sink) = self.peer_sink(key) else {
                return false;
            };
            let Some(endpoint) = self.endpoints.get_mut(key) else {
                return false;
            };
            if !endpoint.connected {
                return false;
            }
            let Some(chunk) = endpoint.outbound.pop_front() else {
                return false;
            };

            let len = chunk.len() as u64;
            let before = endpoint.buffered;
            endpoint.buffered -= len;
            let drained = before > endpoint.low_threshold && endpoint.buffered <= endpoint.low_threshold;
            let own_sink = endpoint.sink.clone();

            peer_sink.emit(DirectEvent::Data(chunk));
            if drained {
                own_sink.emit(DirectEvent::BufferedAmountLow);
            }
            *self.delivered.entry(key.clone()).or_insert(0) += len;
            true
        }
    }

    /// Shared medium for mock direct connections
    #[derive(Clone, Default)]
    pub struct MockDirectNetwork {
        inner: Arc<Mutex<Inner>>,
    }

    impl MockDirectNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap()
        }

        /// Advertise a maximum message size on every connection
        pub fn with_max_message_size(self, size: u64) -> Self {
            self.lock().max_message_size = Some(size);
            self
        }

        /// Deliver up to `max_chunks` buffered data chunks on every link.
        /// Returns the number of chunks delivered.
        pub fn deliver(&self, max_chunks: usize) -> usize {
            let mut inner = self.lock();
            let mut keys: Vec<LinkKey> = inner.endpoints.keys().cloned().collect();
            keys.sort();

            let mut delivered = 0;
            for key in keys {
                for _ in 0..max_chunks {
                    if !inner.deliver_one(&key) {
                        break;
                    }
                    delivered += 1;
                }
            }
            delivered
        }

        /// Deliver everything buffered
        pub fn flush(&self) -> usize {
            self.deliver(usize::MAX)
        }

        /// Data chunks waiting on any link
        pub fn pending_chunks(&self) -> usize {
            self.lock()
                .endpoints
                .values()
                .filter(|e| e.connected)
                .map(|e| e.outbound.len())
                .sum()
        }

        /// Simulate a transport drop between `a` and `b`: buffered data is
        /// lost and both ends see their channels close
        pub fn drop_link(&self, a: &PeerId, b: &PeerId) {
            let mut inner = self.lock();
            inner.break_endpoint(&(a.clone(), b.clone()));
            inner.break_endpoint(&(b.clone(), a.clone()));
        }

        /// Whether `a` currently has an established link to `b`
        pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
            self.lock()
                .endpoints
                .get(&(a.clone(), b.clone()))
                .map(|e| e.connected)
                .unwrap_or(false)
        }

        /// Data channel bytes delivered from `from` to `to`
        pub fn delivered_bytes(&self, from: &PeerId, to: &PeerId) -> u64 {
            self.lock()
                .delivered
                .get(&(from.clone(), to.clone()))
                .copied()
                .unwrap_or(0)
        }

        /// Connection factory for the endpoint `local`
        pub fn factory(&self, local: PeerId) -> MockConnectionFactory {
            MockConnectionFactory {
                network: self.clone(),
                local,
            }
        }
    }

    /// Creates [`MockConnection`]s on behalf of one endpoint
    pub struct MockConnectionFactory {
        network: MockDirectNetwork,
        local: PeerId,
    }

    impl ConnectionFactory for MockConnectionFactory {
        fn connect(
            &self,
            peer_id: &PeerId,
            _config: &RtcConfig,
            events: DirectEventSink,
        ) -> Result<Box<dyn DirectConnection>> {
            let mut inner = self.network.lock();
            inner.next_connection_id += 1;
            let connection_id = inner.next_connection_id;

            let key = (self.local.clone(), peer_id.clone());
            let replaced = inner.endpoints.get(&key).map(|e| e.connected).unwrap_or(false);
            if replaced {
                inner.break_endpoint(&(peer_id.clone(), self.local.clone()));
            }
            inner.endpoints.insert(
                key,
                Endpoint {
                    connection_id,
                    sink: events.clone(),
                    fingerprint: mock_fingerprint(&self.local, connection_id),
                    local: None,
                    remote: None,
                    connected: false,
                    outbound: VecDeque::new(),
                    buffered: 0,
                    low_threshold: 0,
                },
            );
            events.emit(DirectEvent::NegotiationNeeded);

            Ok(Box::new(MockConnection {
                network: self.network.clone(),
                key: (self.local.clone(), peer_id.clone()),
                connection_id,
            }))
        }
    }

    fn mock_fingerprint(local: &PeerId, connection_id: u64) -> String {
        let digest = blake3::hash(format!("{}/{}", local, connection_id).as_bytes());
        let hex = hex::encode_upper(digest.as_bytes());
        let pairs: Vec<&str> = (0..hex.len()).step_by(2).map(|i| &hex[i..i + 2]).collect();
        format!("sha-256 {}", pairs.join(":"))
    }

    fn mock_sdp(connection_id: u64, fingerprint: &str) -> String {
        format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=fingerprint:{}\r\na=sctp-port:5000\r\n",
            connection_id, fingerprint
        )
    }

    /// One side of a mock direct connection
    pub struct MockConnection {
        network: MockDirectNetwork,
        key: LinkKey,
        connection_id: u64,
    }

    impl MockConnection {
        fn with_endpoint<R>(&self, f: impl FnOnce(&mut Endpoint) -> R) -> Option<R> {
            let mut inner = self.network.lock();
            match inner.endpoints.get_mut(&self.key) {
                Some(endpoint) if endpoint.connection_id == self.connection_id => Some(f(endpoint)),
                _ => None,
            }
        }

        fn closed() -> Error {
            Error::Negotiation("connection closed".to_string())
        }

        fn description(&self, kind: SdpType) -> Result<SessionDescription> {
            let fingerprint = self
                .with_endpoint(|e| e.fingerprint.clone())
                .ok_or_else(Self::closed)?;
            Ok(SessionDescription {
                kind,
                sdp: mock_sdp(self.connection_id, &fingerprint),
            })
        }

        fn channel_closed(&self) -> Error {
            Error::ChannelClosed(format!("link to {}", self.key.1))
        }
    }

    #[async_trait]
    impl DirectConnection for MockConnection {
        async fn create_offer(&mut self) -> Result<SessionDescription> {
            self.description(SdpType::Offer)
        }

        async fn create_answer(&mut self) -> Result<SessionDescription> {
            let has_offer = self
                .with_endpoint(|e| matches!(&e.remote, Some(d) if d.kind == SdpType::Offer))
                .unwrap_or(false);
            if !has_offer {
                return Err(Error::Negotiation("no remote offer to answer".to_string()));
            }
            self.description(SdpType::Answer)
        }

        async fn set_local_description(&mut self, description: SessionDescription) -> Result<()> {
            let sink = self
                .with_endpoint(|e| {
                    e.local = Some(description);
                    e.sink.clone()
                })
                .ok_or_else(Self::closed)?;

            sink.emit(DirectEvent::LocalCandidate(Some(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 5000 typ host",
                    self.connection_id
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            })));
            sink.emit(DirectEvent::LocalCandidate(None));

            self.network.lock().try_connect(&self.key.0, &self.key.1);
            Ok(())
        }

        async fn set_remote_description(&mut self, description: SessionDescription) -> Result<()> {
            self.with_endpoint(|e| e.remote = Some(description))
                .ok_or_else(Self::closed)?;
            self.network.lock().try_connect(&self.key.0, &self.key.1);
            Ok(())
        }

        async fn add_ice_candidate(&mut self, _candidate: IceCandidate) -> Result<()> {
            self.with_endpoint(|_| ()).ok_or_else(Self::closed)
        }

        fn local_description(&self) -> Option<SessionDescription> {
            self.with_endpoint(|e| e.local.clone()).flatten()
        }

        fn remote_description(&self) -> Option<SessionDescription> {
            self.with_endpoint(|e| e.remote.clone()).flatten()
        }

        fn connection_state(&self) -> ConnectionState {
            match self.with_endpoint(|e| e.connected) {
                Some(true) => ConnectionState::Connected,
                Some(false) => ConnectionState::Connecting,
                None => ConnectionState::Closed,
            }
        }

        fn channel_state(&self, _channel: Channel) -> ChannelState {
            match self.with_endpoint(|e| e.connected) {
                Some(true) => ChannelState::Open,
                Some(false) => ChannelState::Connecting,
                None => ChannelState::Closed,
            }
        }

        fn send_text(&mut self, text: &str) -> Result<()> {
            let inner = self.network.lock();
            if !inner.is_open(&self.key, self.connection_id) {
                return Err(self.channel_closed());
            }
            let sink = inner.peer_sink(&self.key).ok_or_else(|| self.channel_closed())?;
            sink.emit(DirectEvent::ControlMessage(text.to_string()));
            Ok(())
        }

        fn send_binary(&mut self, data: Bytes) -> Result<()> {
            let open = self
                .with_endpoint(|e| {
                    if e.connected {
                        e.buffered += data.len() as u64;
                        e.outbound.push_back(data);
                    }
                    e.connected
                })
                .unwrap_or(false);
            if open {
                Ok(())
            } else {
                Err(self.channel_closed())
            }
        }

        fn buffered_amount(&self) -> u64 {
            self.with_endpoint(|e| e.buffered).unwrap_or(0)
        }

        fn set_buffered_amount_low_threshold(&mut self, threshold: u64) {
            self.with_endpoint(|e| e.low_threshold = threshold);
        }

        fn max_message_size(&self) -> Option<u64> {
            self.network.lock().max_message_size
        }

        fn close(&mut self) {
            let mut inner = self.network.lock();
            let owned = inner
                .endpoints
                .get(&self.key)
                .map(|e| e.connection_id == self.connection_id)
                .unwrap_or(false);
            if !owned {
                return;
            }
            let was_connected = inner
                .endpoints
                .remove(&self.key)
                .map(|e| e.connected)
                .unwrap_or(false);
            if was_connected {
                inner.break_endpoint(&(self.key.1.clone(), self.key.0.clone()));
            }
        }
    }

}
