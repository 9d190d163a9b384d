//! Per-peer session state machine
//!
//! A [`PeerSession`] owns everything about one remote peer: its room
//! memberships, the transport [`Link`], the transfer request/response
//! protocol, the active chunker or digester, and text messaging.
//!
//! Sender side: `idle -> prepare -> wait -> transfer -> idle`.
//! Receiver side: `idle -> receive -> idle`. Texts: `idle -> text-sent -> idle`.
//!
//! A message that does not fit the current state is answered with our
//! state instead of an error. Both sides announce their state whenever the
//! link (re)stabilizes, which is how an interrupted file resumes: a
//! receiver that sees the sender still in `transfer` asks for a resend
//! from the bytes it already has.

pub mod direct;
pub mod link;
pub mod relay;
pub mod rooms;

use crate::events::{EventSink, Notice, PeerEvent};
use bytes::Bytes;
use link::{Link, LinkEvent, LinkPort, Outbox};
use pairlink_core::assembly;
use pairlink_core::proto::{decode_text, ClientMessage, Message, SignalMessage};
use pairlink_core::throughput::ThroughputLog;
use pairlink_core::{
    DirectSignal, Error, FileContent, FileHeader, OutgoingFile, PeerId, ProgressStatus, ReceivedFile, Receiver,
    RoomType, Sender, ServerConnection, SessionState, TransferRequest, TransferSettings, PAIR_SECRET_LEN,
};
use rooms::Rooms;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Instant;

/// What a session needs from its surroundings
#[derive(Clone, Debug)]
pub struct SessionContext {
    pub server: ServerConnection,
    pub events: EventSink,
    pub settings: TransferSettings,
    /// Enables streaming assembly to disk
    pub download_dir: Option<PathBuf>,
}

/// Result of handling an input, for the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Steady,
    /// The link (re)stabilized
    Connected,
}

/// Receive side bookkeeping of an accepted request
struct InboundTransfer {
    request: TransferRequest,
    /// Headers of files still to come, in order
    remaining: VecDeque<FileHeader>,
    files: Vec<ReceivedFile>,
    /// Bytes of files already reassembled
    bytes_completed: u64,
    last_progress: f64,
    throughput: ThroughputLog,
    file_started: Instant,
}

impl InboundTransfer {
    fn new(request: TransferRequest) -> Self {
        Self {
            remaining: request.header.iter().cloned().collect(),
            request,
            files: Vec::new(),
            bytes_completed: 0,
            last_progress: 0.0,
            throughput: ThroughputLog::new(),
            file_started: Instant::now(),
        }
    }
}

pub struct PeerSession {
    peer_id: PeerId,
    is_caller: bool,
    rooms: Rooms,
    same_device: bool,
    auto_accept: bool,
    display_name: Option<String>,

    state: SessionState,
    /// Texts sent and not acknowledged yet
    pending_texts: usize,

    files_requested: Vec<OutgoingFile>,
    files_queue: VecDeque<OutgoingFile>,
    sender: Option<Sender>,

    pending_request: Option<TransferRequest>,
    inbound: Option<InboundTransfer>,
    receiver: Option<Receiver>,

    link: Link,
    ctx: SessionContext,
}

/// Writer for `peer_id`, borrowing only the server handle
fn outbox<'a>(server: &'a ServerConnection, rooms: &Rooms, peer_id: &PeerId) -> Outbox<'a> {
    Outbox::new(server, rooms.route(peer_id))
}

impl PeerSession {
    pub fn new(
        peer_id: PeerId,
        is_caller: bool,
        room_type: RoomType,
        room_id: impl Into<String>,
        link: Link,
        ctx: SessionContext,
        same_device: bool,
    ) -> Self {
        let mut session = Self {
            peer_id,
            is_caller,
            rooms: Rooms::default(),
            same_device,
            auto_accept: false,
            display_name: None,
            state: SessionState::Idle,
            pending_texts: 0,
            files_requested: Vec::new(),
            files_queue: VecDeque::new(),
            sender: None,
            pending_request: None,
            inbound: None,
            receiver: None,
            link,
            ctx,
        };
        session.update_rooms(room_type, room_id);
        session
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_caller(&self) -> bool {
        self.is_caller
    }

    pub fn rooms(&self) -> &Rooms {
        &self.rooms
    }

    pub fn is_direct(&self) -> bool {
        self.link.is_direct()
    }

    pub fn is_stable(&self) -> bool {
        self.link.is_stable()
    }

    pub fn auto_accept(&self) -> bool {
        self.auto_accept
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn pending_request(&self) -> Option<&TransferRequest> {
        self.pending_request.as_ref()
    }

    /// Begin establishing the link
    pub async fn start(&mut self) {
        let out = outbox(&self.ctx.server, &self.rooms, &self.peer_id);
        match &mut self.link {
            Link::Direct(direct) => direct.connect(self.is_caller, &out, &self.ctx.events).await,
            Link::Relay(relay) => relay.start(self.is_caller, &out),
        }
    }

    /// Re-establish the link, possibly with the roles switched
    pub async fn refresh(&mut self, is_caller: bool) {
        self.is_caller = is_caller;
        let out = outbox(&self.ctx.server, &self.rooms, &self.peer_id);
        self.link
            .refresh(&self.peer_id, self.is_caller, &out, &self.ctx.events)
            .await;
    }

    pub fn disconnect(&mut self) {
        tracing::info!("Disconnecting from {}", self.peer_id);
        self.link.disconnect();
    }

    pub async fn on_direct_event(&mut self, signal: DirectSignal) -> Flow {
        let Link::Direct(direct) = &mut self.link else {
            tracing::debug!("Ignoring direct event for relayed session {}", self.peer_id);
            return Flow::Steady;
        };
        let out = outbox(&self.ctx.server, &self.rooms, &self.peer_id);
        match direct.on_event(signal, self.is_caller, &out, &self.ctx.events).await {
            Some(event) => self.on_link_event(event).await,
            None => Flow::Steady,
        }
    }

    /// Handle a `signal` forwarded by the server
    pub async fn on_signal(&mut self, signal: SignalMessage) -> Flow {
        let out = outbox(&self.ctx.server, &self.rooms, &self.peer_id);
        let event = match &mut self.link {
            Link::Direct(direct) => {
                direct
                    .on_signal(signal, self.is_caller, &out, &self.ctx.events)
                    .await;
                None
            }
            Link::Relay(relay) => relay.on_signal(&self.peer_id, signal, &out),
        };
        match event {
            Some(event) => self.on_link_event(event).await,
            None => Flow::Steady,
        }
    }

    /// Handle a `ws-relay` payload forwarded by the server
    pub async fn on_relay(&mut self, message: Message) -> Flow {
        let Link::Relay(relay) = &mut self.link else {
            tracing::debug!("Ignoring relayed message for direct session {}", self.peer_id);
            return Flow::Steady;
        };
        match relay.on_relay(&self.peer_id, message) {
            Some(event) => self.on_link_event(event).await,
            None => Flow::Steady,
        }
    }

    pub async fn on_link_event(&mut self, event: LinkEvent) -> Flow {
        match event {
            LinkEvent::Stabilized => return self.on_connected(),
            LinkEvent::Message(message) => self.on_message(message).await,
            LinkEvent::Data(data) => self.on_chunk(data).await,
            LinkEvent::Drained => self.pump().await,
        }
        Flow::Steady
    }

    fn on_connected(&mut self) -> Flow {
        let connection_hash = self.link.connection_hash(self.is_caller);
        tracing::info!("Connected to {} ({})", self.peer_id, if self.link.is_direct() { "direct" } else { "relay" });
        self.ctx.events.emit(PeerEvent::PeerConnected {
            peer_id: self.peer_id.clone(),
            connection_hash,
        });
        self.send_state();
        Flow::Connected
    }

    fn send(&mut self, message: Message) {
        let out = outbox(&self.ctx.server, &self.rooms, &self.peer_id);
        self.link.send_message(&message, &out);
    }

    fn send_state(&mut self) {
        self.send(Message::State { state: self.state });
    }

    pub fn send_display_name(&mut self, display_name: Option<&str>) {
        self.send(Message::DisplayNameChanged {
            display_name: display_name.map(str::to_string),
        });
    }

    fn set_progress(&self, progress: f64, status: Option<ProgressStatus>) {
        self.ctx.events.emit(PeerEvent::SetProgress {
            peer_id: self.peer_id.clone(),
            progress,
            status,
        });
    }

    fn notify(&self, notice: Notice) {
        self.ctx.events.emit(PeerEvent::NotifyUser(notice));
    }

    // Rooms

    /// Add or replace a room membership, handling pairing secret rotation
    pub fn update_rooms(&mut self, room_type: RoomType, room_id: impl Into<String>) {
        let room_id = room_id.into();
        let is_secret = room_type == RoomType::Secret;

        // Peers on the same device share all secrets, so a second one says nothing
        if !self.same_device && is_secret {
            if let Some(previous) = self.rooms.secret() {
                if previous != room_id {
                    tracing::debug!("{} paired again, dropping the previous secret", self.peer_id);
                    self.ctx.events.emit(PeerEvent::RoomSecretObsolete {
                        secret: previous.to_string(),
                    });
                }
            }
        }

        self.rooms.set(room_type, room_id);

        if !self.same_device && is_secret && self.is_caller {
            if let Some(secret) = self.rooms.secret() {
                if secret.len() != PAIR_SECRET_LEN {
                    tracing::debug!("Requesting regeneration of the secret shared with {}", self.peer_id);
                    self.ctx.server.send(ClientMessage::RegenerateRoomSecret {
                        room_secret: secret.to_string(),
                    });
                }
            }
        }
    }

    pub fn remove_room_type(&mut self, room_type: RoomType) {
        if !self.rooms.remove(room_type) {
            return;
        }
        self.ctx.events.emit(PeerEvent::RoomTypeRemoved {
            peer_id: self.peer_id.clone(),
            room_type,
        });
    }

    pub fn set_auto_accept(&mut self, auto_accept: bool) {
        self.auto_accept = auto_accept && !self.same_device;
    }

    pub fn set_same_device(&mut self, same_device: bool) {
        self.same_device = same_device;
        if same_device {
            self.auto_accept = false;
        }
    }

    // Commands

    /// Announce `files` to the peer and wait for its answer
    pub fn request_file_transfer(&mut self, files: Vec<OutgoingFile>, thumbnail_data_url: Option<String>) {
        if files.is_empty() {
            tracing::debug!("No files selected for {}", self.peer_id);
            return;
        }
        if !matches!(self.state, SessionState::Idle | SessionState::TextSent) {
            tracing::warn!("Cannot request a transfer to {} while in state {}", self.peer_id, self.state);
            return;
        }

        self.state = SessionState::Prepare;
        self.set_progress(0.0, Some(ProgressStatus::Prepare));

        let request = TransferRequest::for_files(&files, thumbnail_data_url);
        self.set_progress(1.0, Some(ProgressStatus::Prepare));
        self.files_requested = files;

        tracing::info!(
            "Requesting transfer of {} files ({} bytes) to {}",
            request.header.len(),
            request.total_size,
            self.peer_id
        );
        self.send(Message::TransferRequest(request));
        self.set_progress(0.0, Some(ProgressStatus::Wait));
        self.state = SessionState::Wait;
    }

    /// Accept or decline the pending inbound request
    pub fn respond_to_transfer_request(&mut self, accepted: bool) {
        let Some(request) = self.pending_request.take() else {
            tracing::debug!("No pending transfer request from {}", self.peer_id);
            return;
        };

        // Our own request or transfer is still running
        let busy = !matches!(self.state, SessionState::Idle | SessionState::TextSent);
        if accepted && busy {
            tracing::warn!("Declining transfer from {} while in state {}", self.peer_id, self.state);
        }
        let accepted = accepted && !busy;

        self.send(Message::TransferResponse { accepted });
        if accepted {
            self.state = SessionState::Receive;
            self.inbound = Some(InboundTransfer::new(request));
        }
    }

    pub fn send_text(&mut self, text: &str) {
        if self.state == SessionState::Idle {
            self.state = SessionState::TextSent;
        }
        self.pending_texts += 1;
        self.send(Message::text(text));
    }

    // Inbound protocol

    async fn on_message(&mut self, message: Message) {
        tracing::debug!("Received {} from {}", message.kind(), self.peer_id);
        match message {
            Message::State { state } => self.on_receive_state(state),
            Message::TransferRequest(request) => self.on_transfer_request(request),
            Message::TransferResponse { accepted } => self.on_transfer_response(accepted).await,
            Message::TransferHeader(header) => self.on_transfer_header(header).await,
            Message::ReceiveProgress { progress } => self.on_receive_progress(progress),
            Message::ReceiveConfirmation { bytes_received } => {
                self.on_receive_confirmation(bytes_received).await
            }
            Message::ResendRequest { offset } => self.on_resend_request(offset).await,
            Message::FileTransferComplete {
                success,
                duration,
                size,
                speed,
            } => {
                self.on_file_transfer_complete(success, duration, size, speed)
                    .await
            }
            Message::Text { text } => self.on_text(&text),
            Message::TextSent => self.on_text_sent(),
            Message::DisplayNameChanged { display_name } => self.on_display_name_changed(display_name),
            Message::Chunk { .. } => {
                tracing::warn!("Chunk from {} arrived outside the relay", self.peer_id);
            }
        }
    }

    fn on_receive_state(&mut self, peer_state: SessionState) {
        match self.state {
            SessionState::Receive => {
                let received = self.receiver.as_ref().map(Receiver::bytes_received);
                let offset = match received {
                    Some(offset) if peer_state == SessionState::Transfer => offset,
                    _ => {
                        tracing::warn!("{} is in state {} during our receive, aborting", self.peer_id, peer_state);
                        self.abort();
                        return;
                    }
                };
                // The link was re-established mid-file
                tracing::info!("Asking {} to resend from offset {}", self.peer_id, offset);
                self.send(Message::ResendRequest { offset });
            }
            SessionState::Transfer if peer_state != SessionState::Receive => {
                tracing::warn!("{} is in state {} during our transfer, aborting", self.peer_id, peer_state);
                self.abort();
            }
            _ => {}
        }
    }

    fn on_transfer_request(&mut self, request: TransferRequest) {
        if self.pending_request.is_some() || self.inbound.is_some() {
            tracing::warn!("{} sent a second transfer request, declining", self.peer_id);
            self.send(Message::TransferResponse { accepted: false });
            return;
        }

        self.pending_request = Some(request.clone());

        if self.auto_accept {
            tracing::info!("Auto-accepting transfer from {}", self.peer_id);
            self.respond_to_transfer_request(true);
            return;
        }

        self.ctx.events.emit(PeerEvent::FilesTransferRequest {
            peer_id: self.peer_id.clone(),
            request,
        });
    }

    async fn on_transfer_response(&mut self, accepted: bool) {
        if self.state != SessionState::Wait {
            self.send_state();
            return;
        }

        if !accepted {
            tracing::info!("{} declined the transfer", self.peer_id);
            self.set_progress(0.0, None);
            self.state = SessionState::Idle;
            self.files_requested.clear();
            return;
        }

        self.set_progress(0.0, Some(ProgressStatus::Transfer));
        self.state = SessionState::Transfer;
        self.files_queue.extend(self.files_requested.drain(..));
        if self.sender.is_none() {
            self.dequeue_file().await;
        }
    }

    async fn dequeue_file(&mut self) {
        let Some(file) = self.files_queue.pop_front() else {
            return;
        };
        let (chunk_size, backpressure) = self.link.chunk_plan(&self.ctx.settings);
        let sender = Sender::new(file, chunk_size, backpressure);

        tracing::debug!("Sending {} to {} in chunks of {}", sender.file().name, self.peer_id, chunk_size);
        self.send(Message::TransferHeader(sender.header()));
        self.sender = Some(sender);
        self.state = SessionState::Transfer;
        self.pump().await;
    }

    /// Put as many chunks on the link as it has room for
    pub async fn pump(&mut self) {
        if self.state != SessionState::Transfer {
            return;
        }
        let Some(sender) = self.sender.as_mut() else {
            return;
        };

        let out = outbox(&self.ctx.server, &self.rooms, &self.peer_id);
        let mut port = LinkPort::new(&mut self.link, &out);
        match sender.pump(&mut port).await {
            Ok(_) => {}
            Err(Error::ChannelClosed(reason)) | Err(Error::Transport(reason)) => {
                tracing::debug!("Sending to {} paused: {}", self.peer_id, reason);
            }
            Err(e) => {
                tracing::error!("Reading file for {} failed: {}", self.peer_id, e);
                self.abort();
            }
        }
    }

    async fn on_transfer_header(&mut self, header: FileHeader) {
        if self.state != SessionState::Receive {
            self.send_state();
            return;
        }
        if let Some(inbound) = self.inbound.as_mut() {
            inbound.file_started = Instant::now();
        }

        // Empty files carry no chunks
        let empty = header.size == 0;
        self.receiver = Some(Receiver::new(header, self.ctx.settings.max_unconfirmed_bytes));
        if empty {
            self.finish_file().await;
        }
    }

    async fn on_chunk(&mut self, data: Bytes) {
        if self.state != SessionState::Receive || data.is_empty() || self.inbound.is_none() {
            self.send_state();
            return;
        }
        let Some(receiver) = self.receiver.as_mut() else {
            self.send_state();
            return;
        };

        let digested = receiver.unchunk(data);
        let file_bytes = receiver.bytes_received();

        let Some(inbound) = self.inbound.as_ref() else {
            return;
        };
        let total_size = inbound.request.total_size;
        let progress = if total_size == 0 {
            1.0
        } else {
            (inbound.bytes_completed + file_bytes) as f64 / total_size as f64
        };

        if progress > 1.0 {
            tracing::error!("Too many bytes received from {}, aborting", self.peer_id);
            self.abort();
            return;
        }

        if let Some(confirmed) = digested.confirm {
            self.send_receive_confirmation(confirmed);
        }

        self.set_progress(progress, Some(ProgressStatus::Receive));

        let step = self.ctx.settings.progress_step;
        let report = match self.inbound.as_mut() {
            Some(inbound) if progress - inbound.last_progress >= step || progress >= 1.0 => {
                inbound.last_progress = progress;
                true
            }
            _ => false,
        };
        if report {
            self.send(Message::ReceiveProgress { progress });
        }

        if digested.complete {
            self.finish_file().await;
        }
    }

    fn send_receive_confirmation(&mut self, bytes_received: u64) {
        self.send(Message::ReceiveConfirmation { bytes_received });

        let Some(inbound) = self.inbound.as_mut() else {
            return;
        };
        let total = inbound.bytes_completed + bytes_received;
        if let Some(estimate) = inbound.throughput.record(total, inbound.request.total_size) {
            tracing::debug!(
                "Receiving from {} at {}, {} left",
                self.peer_id,
                estimate.speed_string(),
                estimate.time_string()
            );
            self.ctx.events.emit(PeerEvent::TransferSpeed {
                peer_id: self.peer_id.clone(),
                speed: estimate.speed_string(),
                time_left: estimate.time_string(),
            });
        }
    }

    async fn finish_file(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        let (header, parts) = receiver.into_parts();

        let file = match assembly::assemble(header, parts, self.ctx.download_dir.as_deref()).await {
            Ok(file) => file,
            Err(e) => {
                tracing::error!("Could not assemble file from {}: {}", self.peer_id, e);
                self.abort();
                return;
            }
        };

        let expected = self.inbound.as_mut().and_then(|i| i.remaining.pop_front());
        let fits = matches!(&expected, Some(h) if h.name == file.name && h.size == file.size);
        if !fits {
            tracing::error!("Received files differ from the files {} announced, aborting", self.peer_id);
            if let FileContent::Disk(path) = &file.content {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    tracing::warn!("Could not remove {}: {}", path.display(), e);
                }
            }
            self.abort();
            self.notify(Notice::FilesIncorrect);
            return;
        }

        self.single_file_complete(file);

        let done = self.inbound.as_ref().map_or(true, |i| i.remaining.is_empty());
        if done {
            self.set_progress(1.0, Some(ProgressStatus::Receive));
            self.all_files_complete();
        }
    }

    fn single_file_complete(&mut self, file: ReceivedFile) {
        let started = self
            .inbound
            .as_ref()
            .map_or_else(Instant::now, |i| i.file_started);
        let duration = started.elapsed().as_secs_f64();
        let size = (10.0 * file.size as f64 / 1e6).round() / 10.0;
        let speed = (duration > 0.0).then(|| (100.0 * size / duration).round() / 100.0);

        tracing::info!(
            "File {} received from {}: {} MB in {:.3} s",
            file.name,
            self.peer_id,
            size,
            duration
        );

        self.send(Message::FileTransferComplete {
            success: true,
            duration: Some(duration),
            size: Some(size),
            speed,
        });

        self.ctx.events.emit(PeerEvent::FileReceived {
            peer_id: self.peer_id.clone(),
            file: file.clone(),
        });

        if let Some(inbound) = self.inbound.as_mut() {
            inbound.bytes_completed += file.size;
            inbound.files.push(file);
        }
    }

    fn all_files_complete(&mut self) {
        self.state = SessionState::Idle;
        let Some(inbound) = self.inbound.take() else {
            return;
        };
        tracing::info!("Received {} files from {}", inbound.files.len(), self.peer_id);
        self.ctx.events.emit(PeerEvent::FilesReceived {
            peer_id: self.peer_id.clone(),
            files: inbound.files,
            images_only: inbound.request.images_only,
            total_size: inbound.request.total_size,
        });
    }

    fn on_receive_progress(&mut self, progress: f64) {
        if self.state != SessionState::Transfer {
            self.send_state();
            return;
        }
        self.set_progress(progress, Some(ProgressStatus::Transfer));
    }

    async fn on_receive_confirmation(&mut self, bytes_received: u64) {
        let resume = match self.sender.as_mut() {
            Some(sender) if self.state == SessionState::Transfer => sender.on_receive_confirmation(bytes_received),
            _ => {
                self.send_state();
                return;
            }
        };
        if resume {
            self.pump().await;
        }
    }

    async fn on_resend_request(&mut self, offset: u64) {
        if self.state != SessionState::Transfer || self.sender.is_none() {
            self.send(Message::FileTransferComplete {
                success: false,
                duration: None,
                size: None,
                speed: None,
            });
            return;
        }

        // The link may have changed under the sender
        let (chunk_size, backpressure) = self.link.chunk_plan(&self.ctx.settings);
        if let Some(sender) = self.sender.as_mut() {
            sender.retarget(chunk_size, backpressure);
            sender.resend_from_offset(offset);
        }
        self.pump().await;
    }

    async fn on_file_transfer_complete(
        &mut self,
        success: bool,
        duration: Option<f64>,
        size: Option<f64>,
        speed: Option<f64>,
    ) {
        if !success {
            match self.state {
                SessionState::Receive => {
                    tracing::warn!("{} aborted the transfer", self.peer_id);
                    self.abort();
                }
                SessionState::Transfer => {
                    tracing::warn!("File could not be sent to {}", self.peer_id);
                    self.abort();
                }
                _ => self.send_state(),
            }
            return;
        }

        if self.state != SessionState::Transfer {
            self.send_state();
            return;
        }

        if let Some(sender) = self.sender.take() {
            tracing::info!(
                "File {} sent to {}: {:?} MB in {:?} s at {:?} MB/s",
                sender.file().name,
                self.peer_id,
                size,
                duration,
                speed
            );
        }

        if !self.files_queue.is_empty() {
            self.dequeue_file().await;
            return;
        }

        self.state = SessionState::Idle;
        self.set_progress(0.0, Some(ProgressStatus::TransferComplete));
        self.notify(Notice::FileTransferCompleted);
        self.ctx.events.emit(PeerEvent::FilesSent {
            peer_id: self.peer_id.clone(),
        });
    }

    fn on_text(&mut self, encoded: &str) {
        if encoded.is_empty() {
            return;
        }
        match decode_text(encoded) {
            Ok(text) => {
                self.ctx.events.emit(PeerEvent::TextReceived {
                    peer_id: self.peer_id.clone(),
                    text,
                });
                self.send(Message::TextSent);
            }
            Err(e) => tracing::warn!("Malformed text from {}: {}", self.peer_id, e),
        }
    }

    fn on_text_sent(&mut self) {
        if self.pending_texts == 0 {
            self.send_state();
            return;
        }
        self.pending_texts -= 1;
        if self.pending_texts == 0 && self.state == SessionState::TextSent {
            self.state = SessionState::Idle;
        }
        self.notify(Notice::MessageTransferCompleted);
    }

    fn on_display_name_changed(&mut self, display_name: Option<String>) {
        let Some(display_name) = display_name.filter(|n| !n.is_empty()) else {
            return;
        };
        if self.display_name.as_deref() == Some(display_name.as_str()) {
            return;
        }

        self.display_name = Some(display_name.clone());
        self.ctx.events.emit(PeerEvent::PeerDisplayNameChanged {
            peer_id: self.peer_id.clone(),
            display_name,
            room_secret: self.rooms.secret().map(str::to_string),
        });
    }

    /// Drop all transfer state in both directions and tell the peer
    fn abort(&mut self) {
        self.set_progress(0.0, None);
        self.state = SessionState::Idle;
        self.sender = None;
        self.files_queue.clear();
        self.files_requested.clear();
        self.pending_request = None;
        self.inbound = None;
        self.receiver = None;
        self.send_state();
    }
}
