//! Per-connection client session: request framing, pending-request
//! tracking, write back-pressure and the authentication state machine.
//!
//! Socket I/O runs in per-client tasks (see `network`); the session state
//! itself is only touched from the event loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use bytes::{Buf, BytesMut};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tfp::packet::{function, UID_BRICK_DAEMON};
use tfp::{ErrorCode, Header, Packet, PacketError};

use crate::auth;
use crate::metrics::Metrics;
use crate::reactor::SourceId;

pub type ClientId = u64;

/// How long a pending request stays matchable.
pub const PENDING_REQUEST_EXPIRY: Duration = Duration::from_secs(3);

/// Bound on the pending-request queue; the oldest entry is expired on
/// overflow.
pub const MAX_PENDING_REQUESTS: usize = 32;

/// Send-backlog high-water mark in bytes. A client above it is "slow" and
/// stops receiving callbacks until it drains below the low-water mark.
pub const SEND_BACKLOG_HIGH_WATER: usize = 512 * tfp::packet::MAX_PACKET_SIZE;
pub const SEND_BACKLOG_LOW_WATER: usize = SEND_BACKLOG_HIGH_WATER / 4;

/// Events the transport tasks queue for the event loop.
pub enum ClientEvent {
    Request(Packet),
    Disconnected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationState {
    /// No secret configured; behaves like Authenticated.
    Disabled,
    EnabledUnauthenticated,
    EnabledNonceSent,
    Authenticated,
}

struct PendingRequest {
    header: Header,
    since: Instant,
}

pub struct ClientSession {
    pub id: ClientId,
    pub name: String,
    pub source: SourceId,
    pub dead: bool,
    authentication_state: AuthenticationState,
    server_nonce: Option<[u8; auth::NONCE_LENGTH]>,
    pending: VecDeque<PendingRequest>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) backlog: Arc<AtomicUsize>,
    slow: bool,
    metrics: Arc<Metrics>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: ClientId,
        name: String,
        source: SourceId,
        secret_configured: bool,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        backlog: Arc<AtomicUsize>,
        metrics: Arc<Metrics>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            id,
            name,
            source,
            dead: false,
            authentication_state: if secret_configured {
                AuthenticationState::EnabledUnauthenticated
            } else {
                AuthenticationState::Disabled
            },
            server_nonce: None,
            pending: VecDeque::new(),
            tx,
            backlog,
            slow: false,
            metrics,
            tasks,
        }
    }

    pub fn authentication_state(&self) -> AuthenticationState {
        self.authentication_state
    }

    /// True when requests may be forwarded and responses delivered.
    pub fn authenticated(&self) -> bool {
        matches!(
            self.authentication_state,
            AuthenticationState::Disabled | AuthenticationState::Authenticated
        )
    }

    /// Latched back-pressure check with hysteresis.
    pub fn is_slow(&mut self) -> bool {
        let backlog = self.backlog.load(Ordering::Relaxed);

        if backlog > SEND_BACKLOG_HIGH_WATER {
            if !self.slow {
                warn!(
                    "Client {} has a send backlog of {} bytes, dropping callbacks",
                    self.name, backlog
                );
            }
            self.slow = true;
        } else if self.slow && backlog < SEND_BACKLOG_LOW_WATER {
            info!("Client {} drained its send backlog", self.name);
            self.slow = false;
        }

        self.slow
    }

    /// Queue a packet for the writer task. Marks the session dead when the
    /// writer is gone.
    pub fn send_packet(&mut self, packet: &Packet) -> bool {
        if self.dead {
            return false;
        }

        let bytes = packet.to_bytes();
        self.backlog.fetch_add(bytes.len(), Ordering::Relaxed);

        if self.tx.send(bytes).is_err() {
            self.dead = true;
            return false;
        }

        true
    }

    pub fn add_pending(&mut self, header: Header) {
        if self.pending.len() >= MAX_PENDING_REQUESTS {
            warn!(
                "Pending request queue of client {} is full, expiring the oldest entry",
                self.name
            );
            self.pending.pop_front();
            self.metrics.inc_pending_expired();
        }

        self.pending.push_back(PendingRequest {
            header,
            since: Instant::now(),
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Remove and report a pending entry matching `response`. Entries older
    /// than the expiry are discarded during the scan, so a stale match is
    /// never delivered.
    pub fn take_matching_pending(&mut self, response: &Packet) -> bool {
        let now = Instant::now();
        let metrics = Arc::clone(&self.metrics);

        self.pending.retain(|pending| {
            if now.duration_since(pending.since) >= PENDING_REQUEST_EXPIRY {
                metrics.inc_pending_expired();
                false
            } else {
                true
            }
        });

        if let Some(position) = self
            .pending
            .iter()
            .position(|pending| response.matches_pending(&pending.header))
        {
            self.pending.remove(position);
            true
        } else {
            false
        }
    }

    /// Handle a request addressed to the daemon itself (uid 1): the
    /// authentication handshake lives here.
    pub fn handle_daemon_request(&mut self, secret: Option<&str>, request: &Packet) {
        match request.header.function_id {
            function::GET_AUTHENTICATION_NONCE => {
                self.handle_get_authentication_nonce(secret, request)
            }
            function::AUTHENTICATE => self.handle_authenticate(secret, request),
            _ => {
                debug!(
                    "Client {} sent unknown daemon function ({})",
                    self.name,
                    request.request_signature()
                );
                self.send_error_response(request, ErrorCode::FunctionNotSupported);
            }
        }
    }

    fn handle_get_authentication_nonce(&mut self, secret: Option<&str>, request: &Packet) {
        if secret.is_none() {
            warn!(
                "Client {} requested an authentication nonce, but authentication is disabled",
                self.name
            );
            self.send_error_response(request, ErrorCode::FunctionNotSupported);
            return;
        }

        let nonce = auth::generate_server_nonce();
        self.server_nonce = Some(nonce);
        self.authentication_state = AuthenticationState::EnabledNonceSent;

        debug!("Sending authentication nonce to client {}", self.name);

        let mut header = request.header;
        header.set_error_code(ErrorCode::Ok);
        let response = Packet::new(header, &nonce);
        self.send_packet(&response);
    }

    fn handle_authenticate(&mut self, secret: Option<&str>, request: &Packet) {
        let Some(secret) = secret else {
            warn!(
                "Client {} tried to authenticate, but authentication is disabled",
                self.name
            );
            self.send_error_response(request, ErrorCode::FunctionNotSupported);
            return;
        };

        let Some(server_nonce) = self.server_nonce.take() else {
            warn!(
                "Client {} tried to authenticate without requesting a nonce first, disconnecting it",
                self.name
            );
            self.dead = true;
            return;
        };

        let payload = request.payload();

        if payload.len() != auth::NONCE_LENGTH + auth::DIGEST_LENGTH {
            warn!(
                "Client {} sent a malformed authenticate request, disconnecting it",
                self.name
            );
            self.dead = true;
            return;
        }

        let mut client_nonce = [0u8; auth::NONCE_LENGTH];
        client_nonce.copy_from_slice(&payload[..auth::NONCE_LENGTH]);

        if !auth::verify_digest(
            secret,
            &server_nonce,
            &client_nonce,
            &payload[auth::NONCE_LENGTH..],
        ) {
            warn!(
                "Client {} sent an authenticate request with a wrong digest, disconnecting it",
                self.name
            );
            self.dead = true;
            return;
        }

        self.authentication_state = AuthenticationState::Authenticated;
        info!("Client {} authenticated successfully", self.name);

        if request.header.response_expected() {
            let mut header = request.header;
            header.set_error_code(ErrorCode::Ok);
            self.send_packet(&Packet::from_header(header));
        }
    }

    /// Echo the request header with an error code, if a response is
    /// expected at all.
    pub fn send_error_response(&mut self, request: &Packet, error_code: ErrorCode) {
        if !request.header.response_expected() {
            return;
        }

        let mut header = request.header;
        header.set_error_code(error_code);
        self.send_packet(&Packet::from_header(header));
    }

    pub fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Byte-stream to packet framing shared by the plain TCP and WebSocket
/// readers: buffer an 8-byte header, validate it, buffer `length` bytes,
/// yield the request. An invalid header poisons the stream.
#[derive(Default)]
pub struct PacketAssembler {
    buffer: BytesMut,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn next_packet(&mut self) -> Result<Option<Packet>, PacketError> {
        if self.buffer.len() < tfp::packet::HEADER_SIZE {
            return Ok(None);
        }

        let mut header_bytes = [0u8; tfp::packet::HEADER_SIZE];
        header_bytes.copy_from_slice(&self.buffer[..tfp::packet::HEADER_SIZE]);
        let header = Header::from_bytes(&header_bytes);

        header.validate_request()?;

        if self.buffer.len() < header.length as usize {
            return Ok(None);
        }

        let frame = self.buffer.copy_to_bytes(header.length as usize);
        Packet::parse(&frame).map(Some)
    }
}

/// Which client a daemon-addressed request belongs to.
pub fn is_daemon_request(packet: &Packet) -> bool {
    packet.header.uid == UID_BRICK_DAEMON
}
