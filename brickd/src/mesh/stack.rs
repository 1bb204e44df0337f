//! Mesh session state machine.
//!
//! A root node TCP-connects and must say hello within 8 seconds. After the
//! olleh reply the session is operational: the gateway pings every 8
//! seconds and tears the session down when a pong takes longer than 4
//! seconds. TFP responses coming out of the mesh carry the node's address,
//! which becomes the recipient route for requests going the other way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tfp::Packet;

use crate::daemon::Daemon;
use crate::hardware::{Registry, StackId};
use crate::mesh::packet::{
    self, MeshHelloPayload, MeshPacketHeader, MeshPacketType, BROADCAST_ADDRESS,
    MESH_ADDRESS_LENGTH, MESH_HEADER_LENGTH, MESH_RESPONSE_BUFFER_LENGTH,
};
use crate::reactor::{Callback, Notifier, Ops, SourceId, SourceKind, SourceQueue};
use crate::stack::{DispatchResult, Recipient, Stack, StackBase};
use crate::timer::Timer;

pub const TIME_WAIT_HELLO: Duration = Duration::from_secs(8);
pub const TIME_HB_DO_PING: Duration = Duration::from_secs(8);
pub const TIME_HB_WAIT_PONG: Duration = Duration::from_secs(4);
pub const TIME_CLEANUP_AFTER_RESET: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshSessionState {
    WaitHello,
    Operational,
}

pub enum MeshEvent {
    Frame(MeshPacketHeader, Vec<u8>),
    Disconnected(String),
}

/// The registry-facing side of an operational mesh session.
pub struct MeshStack {
    base: StackBase,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    gw_addr: [u8; MESH_ADDRESS_LENGTH],
    cleanup: Arc<AtomicBool>,
}

impl Stack for MeshStack {
    fn base(&self) -> &StackBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StackBase {
        &mut self.base
    }

    fn dispatch(&mut self, request: &Packet, recipient: Option<Recipient>) -> DispatchResult {
        // without a route the request goes out as a mesh broadcast
        let dst_addr = recipient
            .map(|recipient| recipient.opaque)
            .unwrap_or(BROADCAST_ADDRESS);

        let bytes = packet::tfp_packet(dst_addr, self.gw_addr, request);

        if self.tx.send(bytes).is_err() {
            self.cleanup.store(true, Ordering::SeqCst);
            return DispatchResult::Error("mesh connection is gone".to_string());
        }

        debug!(
            "Sent request ({}) to mesh stack {}",
            request.request_signature(),
            self.base.name
        );

        DispatchResult::Accepted
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

pub struct MeshSession {
    pub id: u64,
    pub name: String,
    pub source: SourceId,
    pub state: MeshSessionState,
    pub stack_id: Option<StackId>,
    cleanup: Arc<AtomicBool>,
    #[allow(dead_code)]
    prefix: [u8; 16],
    #[allow(dead_code)]
    group_id: [u8; 6],
    #[allow(dead_code)]
    root_node_firmware_version: [u8; 3],
    gw_addr: [u8; MESH_ADDRESS_LENGTH],
    root_node_addr: [u8; MESH_ADDRESS_LENGTH],
    tx: mpsc::UnboundedSender<Vec<u8>>,
    timer_wait_hello: Timer,
    timer_hb_do_ping: Timer,
    timer_hb_wait_pong: Timer,
    timer_cleanup_after_reset: Timer,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshSession {
    pub fn wants_cleanup(&self) -> bool {
        self.cleanup.load(Ordering::SeqCst)
    }

    pub fn set_cleanup(&self) {
        self.cleanup.store(true, Ordering::SeqCst);
    }

    pub fn root_node_addr(&self) -> [u8; MESH_ADDRESS_LENGTH] {
        self.root_node_addr
    }

    fn send_raw(&self, bytes: Vec<u8>) -> bool {
        self.tx.send(bytes).is_ok()
    }

    /// Tear the session down: disarm and drop the timers, detach the event
    /// source and schedule the registry stack (if any) for removal.
    pub fn destroy(mut self, registry: &mut Registry, ops: &mut Ops<Daemon>) {
        for timer in [
            &self.timer_wait_hello,
            &self.timer_hb_do_ping,
            &self.timer_hb_wait_pong,
            &self.timer_cleanup_after_reset,
        ] {
            let _ = timer.disarm();
            timer.destroy(ops);
        }

        ops.remove_source(self.source);

        for task in self.tasks.drain(..) {
            task.abort();
        }

        if let Some(stack_id) = self.stack_id {
            registry.mark_for_removal(stack_id);
        }

        info!(
            "Mesh stack {} released (S: {})",
            self.name,
            match self.state {
                MeshSessionState::WaitHello => "WAIT_HELLO",
                MeshSessionState::Operational => "OPERATIONAL",
            }
        );
    }
}

/// Destroy every session whose cleanup flag is set; runs from the event
/// loop's cleanup pass.
pub fn cleanup_sessions(daemon: &mut Daemon, ops: &mut Ops<Daemon>) {
    let mut index = 0;

    while index < daemon.mesh_sessions.len() {
        if daemon.mesh_sessions[index].wants_cleanup() {
            let session = daemon.mesh_sessions.remove(index);
            session.destroy(&mut daemon.registry, ops);
        } else {
            index += 1;
        }
    }
}

/// Accept a fresh mesh connection: register its event source, start reader
/// and writer tasks and arm the hello deadline.
pub fn create_session(
    daemon: &mut Daemon,
    ops: &mut Ops<Daemon>,
    stream: TcpStream,
    peer: std::net::SocketAddr,
) {
    let id = daemon.allocate_mesh_session_id();
    let name = format!("mesh-{peer}");

    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();

    let events: SourceQueue<MeshEvent> = SourceQueue::new();
    let source = ops.add_source(
        name.clone(),
        SourceKind::Generic,
        session_callback(id, events.clone()),
    );
    let notifier = daemon.handle.notifier(source);

    let (tx, rx) = mpsc::unbounded_channel();

    let tasks = vec![
        tokio::spawn(mesh_reader(read_half, events, notifier)),
        tokio::spawn(mesh_writer(write_half, rx)),
    ];

    let timer_wait_hello = Timer::create(
        ops,
        &daemon.handle,
        format!("{name}-wait-hello"),
        wait_hello_expired(id),
    );
    let timer_hb_do_ping = Timer::create(
        ops,
        &daemon.handle,
        format!("{name}-do-ping"),
        do_ping_expired(id),
    );
    let timer_hb_wait_pong = Timer::create(
        ops,
        &daemon.handle,
        format!("{name}-wait-pong"),
        wait_pong_expired(id),
    );
    let timer_cleanup_after_reset = Timer::create(
        ops,
        &daemon.handle,
        format!("{name}-cleanup"),
        cleanup_expired(id),
    );

    if timer_wait_hello
        .configure(TIME_WAIT_HELLO, Duration::ZERO)
        .is_err()
    {
        warn!("Failed to arm wait hello timer for {name}");
    }

    daemon.mesh_sessions.push(MeshSession {
        id,
        name: name.clone(),
        source,
        state: MeshSessionState::WaitHello,
        stack_id: None,
        cleanup: Arc::new(AtomicBool::new(false)),
        prefix: [0; 16],
        group_id: [0; 6],
        root_node_firmware_version: [0; 3],
        gw_addr: [0; MESH_ADDRESS_LENGTH],
        root_node_addr: [0; MESH_ADDRESS_LENGTH],
        tx,
        timer_wait_hello,
        timer_hb_do_ping,
        timer_hb_wait_pong,
        timer_cleanup_after_reset,
        tasks,
    });

    debug!("Mesh stack is waiting for hello packet ({name})");
}

fn session_callback(id: u64, events: SourceQueue<MeshEvent>) -> Callback<Daemon> {
    Box::new(move |daemon, _ops| {
        match events.pop() {
            Some(MeshEvent::Frame(header, bytes)) => handle_frame(daemon, id, header, bytes),
            Some(MeshEvent::Disconnected(reason)) => {
                if let Some(session) = daemon.mesh_session_mut(id) {
                    info!("Mesh stack {} disconnected ({})", session.name, reason);
                    session.set_cleanup();
                }
            }
            None => {
                debug!("Spurious wake token for mesh session {id}");
            }
        }

        Ok(())
    })
}

fn wait_hello_expired(id: u64) -> Callback<Daemon> {
    Box::new(move |daemon, _ops| {
        let Some(session) = daemon.mesh_session_mut(id) else {
            return Ok(());
        };

        if session.state != MeshSessionState::WaitHello || session.wants_cleanup() {
            return Ok(());
        }

        warn!(
            "Wait hello timed out, destroying mesh stack ({})",
            session.name
        );

        // reset everything listening, then give the reset time to
        // propagate before the session goes away
        if !session.send_raw(packet::reset_packet()) {
            error!("Failed to send broadcast reset packet ({})", session.name);
            session.set_cleanup();
            return Ok(());
        }

        if session
            .timer_cleanup_after_reset
            .configure(TIME_CLEANUP_AFTER_RESET, Duration::ZERO)
            .is_err()
        {
            warn!("Failed to arm stack cleanup timer ({})", session.name);
            session.set_cleanup();
        }

        Ok(())
    })
}

fn do_ping_expired(id: u64) -> Callback<Daemon> {
    Box::new(move |daemon, _ops| {
        let Some(session) = daemon.mesh_session_mut(id) else {
            return Ok(());
        };

        if session.wants_cleanup() {
            return Ok(());
        }

        let ping = packet::ping_packet(session.root_node_addr, session.gw_addr);

        if !session.send_raw(ping) {
            error!(
                "Failed to send ping to mesh root node, cleaning up mesh stack ({})",
                session.name
            );
            session.set_cleanup();
            return Ok(());
        }

        debug!("Sent ping to mesh root node ({})", session.name);

        if session
            .timer_hb_wait_pong
            .configure(TIME_HB_WAIT_PONG, Duration::ZERO)
            .is_err()
        {
            error!(
                "Failed to arm wait pong timer of mesh stack ({}), cleaning up the mesh stack",
                session.name
            );
            session.set_cleanup();
        }

        Ok(())
    })
}

fn wait_pong_expired(id: u64) -> Callback<Daemon> {
    Box::new(move |daemon, _ops| {
        if let Some(session) = daemon.mesh_session_mut(id) {
            warn!(
                "Wait pong timed out, cleaning up mesh stack ({})",
                session.name
            );
            session.set_cleanup();
        }

        Ok(())
    })
}

fn cleanup_expired(id: u64) -> Callback<Daemon> {
    Box::new(move |daemon, _ops| {
        if let Some(session) = daemon.mesh_session_mut(id) {
            debug!("Cleaning up mesh stack ({})", session.name);
            session.set_cleanup();
        }

        Ok(())
    })
}

pub(crate) fn handle_frame(
    daemon: &mut Daemon,
    id: u64,
    header: MeshPacketHeader,
    bytes: Vec<u8>,
) {
    {
        let Some(session) = daemon.mesh_session_mut(id) else {
            return;
        };

        if session.wants_cleanup() {
            warn!(
                "Mesh stack ({}) is already scheduled for cleanup, ignoring receive",
                session.name
            );
            return;
        }
    }

    match header.mesh_packet_type() {
        Some(MeshPacketType::Hello) => handle_hello(daemon, id, header, &bytes),
        Some(MeshPacketType::HeartBeatPing) => {
            let Some(session) = daemon.mesh_session_mut(id) else {
                return;
            };

            debug!("Received mesh ping packet ({})", session.name);

            let pong = packet::pong_packet(header.src_addr, session.gw_addr);

            if !session.send_raw(pong) {
                error!("Failed to send mesh pong packet ({})", session.name);
            }
        }
        Some(MeshPacketType::HeartBeatPong) => {
            let Some(session) = daemon.mesh_session_mut(id) else {
                return;
            };

            debug!("Received mesh pong packet ({})", session.name);
            let _ = session.timer_hb_wait_pong.disarm();
        }
        Some(MeshPacketType::Tfp) => handle_tfp(daemon, id, header, &bytes),
        _ => {
            error!("Unknown mesh packet type received: {}", header.packet_type);
        }
    }
}

fn handle_hello(daemon: &mut Daemon, id: u64, header: MeshPacketHeader, bytes: &[u8]) {
    let Some(hello) = MeshHelloPayload::parse(&bytes[MESH_HEADER_LENGTH..]) else {
        if let Some(session) = daemon.mesh_session_mut(id) {
            error!(
                "Received malformed mesh hello packet from mesh stack ({}), disconnecting mesh stack",
                session.name
            );
            session.set_cleanup();
        }
        return;
    };

    {
        let Some(session) = daemon.mesh_session_mut(id) else {
            return;
        };

        let _ = session.timer_wait_hello.disarm();

        info!(
            "Hello from {} mesh node (F: {}.{}.{}, P: {}, G: {:02X?}, A: {:02X?})",
            if hello.is_root_node { "root" } else { "non-root" },
            hello.firmware_version[0],
            hello.firmware_version[1],
            hello.firmware_version[2],
            hello.prefix_str(),
            hello.group_id,
            header.src_addr
        );

        if !hello.is_root_node {
            // only root nodes carry a stack; everyone else just gets the
            // olleh and stays out of the registry
            let olleh = packet::olleh_packet(header.src_addr, session.gw_addr);

            if !session.send_raw(olleh) {
                error!("Olleh packet send failed ({})", session.name);
                session.set_cleanup();
            }

            return;
        }
    }

    // a reconnecting root node replaces its previous session
    let mut replaced = Vec::new();
    for other in &daemon.mesh_sessions {
        if other.id != id && other.root_node_addr() == header.src_addr {
            replaced.push(other.id);
        }
    }

    for other_id in replaced {
        debug!("Removing previously existing mesh stack");
        if let Some(other) = daemon.mesh_session_mut(other_id) {
            other.set_cleanup();
        }
    }

    let (name, tx, cleanup) = {
        let Some(session) = daemon.mesh_session_mut(id) else {
            return;
        };
        (
            session.name.clone(),
            session.tx.clone(),
            Arc::clone(&session.cleanup),
        )
    };

    let stack = MeshStack {
        base: StackBase::new(name.clone()),
        tx,
        gw_addr: header.dst_addr,
        cleanup,
    };
    let stack_id = daemon.registry.add(Box::new(stack));
    daemon.metrics.stack_added();

    let Some(session) = daemon.mesh_session_mut(id) else {
        return;
    };

    let olleh = packet::olleh_packet(header.src_addr, header.dst_addr);

    if !session.send_raw(olleh) {
        error!("Failed to send mesh olleh packet ({})", session.name);
        session.set_cleanup();
        return;
    }

    session.prefix = hello.prefix;
    session.group_id = hello.group_id;
    session.root_node_firmware_version = hello.firmware_version;
    session.root_node_addr = header.src_addr;
    session.gw_addr = header.dst_addr;
    session.stack_id = Some(stack_id);
    session.state = MeshSessionState::Operational;

    info!(
        "Mesh stack {} changed state to operational (F: {}.{}.{}, P: {}, G: {:02X?})",
        session.name,
        hello.firmware_version[0],
        hello.firmware_version[1],
        hello.firmware_version[2],
        hello.prefix_str(),
        hello.group_id
    );

    if session
        .timer_hb_do_ping
        .configure(Duration::ZERO, TIME_HB_DO_PING)
        .is_err()
    {
        error!(
            "Failed to arm do ping timer ({}), cleaning up the mesh stack",
            session.name
        );
        session.set_cleanup();
    }
}

fn handle_tfp(daemon: &mut Daemon, id: u64, header: MeshPacketHeader, bytes: &[u8]) {
    let (stack_id, name) = {
        let Some(session) = daemon.mesh_session_mut(id) else {
            return;
        };

        if session.state != MeshSessionState::Operational {
            warn!(
                "Dropping mesh packet, mesh stack ({}) is not operational yet",
                session.name
            );
            return;
        }

        let Some(stack_id) = session.stack_id else {
            return;
        };

        (stack_id, session.name.clone())
    };

    // outer length must be exactly header + inner packet and the inner
    // header must hold up as a response
    let inner = Packet::parse(&bytes[MESH_HEADER_LENGTH..])
        .map_err(|e| e.to_string())
        .and_then(|packet| {
            packet
                .header
                .validate_response()
                .map(|_| packet)
                .map_err(|e| e.to_string())
        });

    let inner = match inner {
        Ok(inner) => inner,
        Err(reason) => {
            error!(
                "Received invalid response from mesh stack ({name}), disconnecting mesh stack: {reason}"
            );
            if let Some(session) = daemon.mesh_session_mut(id) {
                session.set_cleanup();
            }
            return;
        }
    };

    // the node's mesh address is the route back to this UID
    if let Some(stack) = daemon.registry.get_mut(stack_id) {
        stack
            .base_mut()
            .recipients
            .add(inner.header.uid, Recipient::from_address(header.src_addr));
    }

    debug!("Received mesh packet (T: TFP, L: {})", header.length);

    daemon.dispatch_response(Some(stack_id), &inner);
}

async fn mesh_reader(
    mut read_half: OwnedReadHalf,
    events: SourceQueue<MeshEvent>,
    notifier: Notifier,
) {
    let mut buffer = BytesMut::with_capacity(MESH_RESPONSE_BUFFER_LENGTH);

    let disconnect = |events: &SourceQueue<MeshEvent>, notifier: &Notifier, reason: String| {
        events.push(MeshEvent::Disconnected(reason));
        notifier.notify();
    };

    loop {
        match read_half.read_buf(&mut buffer).await {
            Ok(0) => {
                disconnect(&events, &notifier, "disconnected by peer".to_string());
                return;
            }
            Ok(_) => {}
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => {
                disconnect(&events, &notifier, format!("receive error: {error}"));
                return;
            }
        }

        loop {
            if buffer.len() < MESH_HEADER_LENGTH {
                break;
            }

            let mut header_bytes = [0u8; MESH_HEADER_LENGTH];
            header_bytes.copy_from_slice(&buffer[..MESH_HEADER_LENGTH]);
            let header = MeshPacketHeader::from_bytes(&header_bytes);

            if let Err(reason) = header.validate_response() {
                disconnect(
                    &events,
                    &notifier,
                    format!("invalid mesh packet header: {reason}"),
                );
                return;
            }

            if buffer.len() < header.length as usize {
                break;
            }

            let frame = buffer.copy_to_bytes(header.length as usize);
            events.push(MeshEvent::Frame(header, frame.to_vec()));

            if !notifier.notify() {
                return;
            }
        }
    }
}

async fn mesh_writer(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    use tokio::io::AsyncWriteExt;

    while let Some(bytes) = rx.recv().await {
        if write_half.write_all(&bytes).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::Metrics;
    use crate::reactor::Reactor;
    use tfp::Header;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;

    struct Harness {
        daemon: Daemon,
        reactor: Reactor<Daemon>,
        peer: TcpStream,
    }

    async fn harness() -> Harness {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let reactor: Reactor<Daemon> = Reactor::new();
        let mut daemon = Daemon::new(
            std::sync::Arc::new(Config::default()),
            std::sync::Arc::new(Metrics::new()),
            reactor.handle(),
        );

        let peer = TcpStream::connect(addr).await.unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();

        let mut ops = reactor.ops();
        create_session(&mut daemon, &mut ops, stream, peer_addr);
        // ops intentionally dropped: the tests drive handle_frame directly

        Harness {
            daemon,
            reactor,
            peer,
        }
    }

    fn hello_frame(is_root: bool, src: [u8; 6], dst: [u8; 6]) -> (MeshPacketHeader, Vec<u8>) {
        let header = MeshPacketHeader::new(
            packet::Direction::Upward,
            false,
            packet::PROTOCOL_BINARY,
            (MESH_HEADER_LENGTH + MeshHelloPayload::LENGTH) as u16,
            dst,
            src,
            MeshPacketType::Hello,
        );

        let mut bytes = header.to_bytes().to_vec();
        bytes.push(is_root as u8);
        bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6]); // group
        let mut prefix = [0u8; 16];
        prefix[..4].copy_from_slice(b"mesh");
        bytes.extend_from_slice(&prefix);
        bytes.extend_from_slice(&[2, 1, 0]); // firmware

        (header, bytes)
    }

    async fn read_mesh_packet(peer: &mut TcpStream) -> (MeshPacketHeader, Vec<u8>) {
        let mut header_bytes = [0u8; MESH_HEADER_LENGTH];
        peer.read_exact(&mut header_bytes).await.unwrap();
        let header = MeshPacketHeader::from_bytes(&header_bytes);

        let mut rest = vec![0u8; header.length as usize - MESH_HEADER_LENGTH];
        peer.read_exact(&mut rest).await.unwrap();

        (header, rest)
    }

    #[tokio::test]
    async fn hello_from_root_makes_the_session_operational() {
        let mut h = harness().await;
        let session_id = h.daemon.mesh_sessions[0].id;

        let (header, bytes) = hello_frame(true, [0xaa; 6], [0xbb; 6]);
        handle_frame(&mut h.daemon, session_id, header, bytes);

        let session = &h.daemon.mesh_sessions[0];
        assert_eq!(session.state, MeshSessionState::Operational);
        assert_eq!(session.root_node_addr(), [0xaa; 6]);
        assert_eq!(session.gw_addr, [0xbb; 6]);
        assert!(session.stack_id.is_some());
        assert_eq!(h.daemon.registry.len(), 1);

        // the peer got an olleh with flipped addresses
        let (olleh, _) = read_mesh_packet(&mut h.peer).await;
        assert_eq!(olleh.mesh_packet_type(), Some(MeshPacketType::Olleh));
        assert_eq!(olleh.dst_addr, [0xaa; 6]);
        assert_eq!(olleh.src_addr, [0xbb; 6]);
        assert_eq!(olleh.direction(), packet::Direction::Downward);

        let _ = &h.reactor;
    }

    #[tokio::test]
    async fn hello_from_non_root_gets_olleh_but_no_stack() {
        let mut h = harness().await;
        let session_id = h.daemon.mesh_sessions[0].id;

        let (header, bytes) = hello_frame(false, [0xaa; 6], [0xbb; 6]);
        handle_frame(&mut h.daemon, session_id, header, bytes);

        assert_eq!(
            h.daemon.mesh_sessions[0].state,
            MeshSessionState::WaitHello
        );
        assert_eq!(h.daemon.registry.len(), 0);

        let (olleh, _) = read_mesh_packet(&mut h.peer).await;
        assert_eq!(olleh.mesh_packet_type(), Some(MeshPacketType::Olleh));
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let mut h = harness().await;
        let session_id = h.daemon.mesh_sessions[0].id;

        let (header, bytes) = hello_frame(true, [0xaa; 6], [0xbb; 6]);
        handle_frame(&mut h.daemon, session_id, header, bytes);
        let _ = read_mesh_packet(&mut h.peer).await; // olleh

        let ping = MeshPacketHeader::new(
            packet::Direction::Upward,
            false,
            packet::PROTOCOL_BINARY,
            MESH_HEADER_LENGTH as u16,
            [0xbb; 6],
            [0xaa; 6],
            MeshPacketType::HeartBeatPing,
        );
        handle_frame(
            &mut h.daemon,
            session_id,
            ping,
            ping.to_bytes().to_vec(),
        );

        let (pong, _) = read_mesh_packet(&mut h.peer).await;
        assert_eq!(pong.mesh_packet_type(), Some(MeshPacketType::HeartBeatPong));
        assert_eq!(pong.dst_addr, [0xaa; 6]);
        assert_eq!(pong.src_addr, [0xbb; 6]);
    }

    #[tokio::test]
    async fn tfp_response_adds_route_and_is_validated() {
        let mut h = harness().await;
        let session_id = h.daemon.mesh_sessions[0].id;

        let (header, bytes) = hello_frame(true, [0xaa; 6], [0xbb; 6]);
        handle_frame(&mut h.daemon, session_id, header, bytes);
        let stack_id = h.daemon.mesh_sessions[0].stack_id.unwrap();

        let mut inner_header = Header {
            uid: 3255,
            length: 8,
            function_id: 7,
            sequence_number_and_options: 0,
            error_code_and_future_use: 0,
        };
        inner_header.set_sequence_number(1);
        inner_header.set_response_expected(true);
        let inner = Packet::from_header(inner_header);

        let node_addr = [9, 8, 7, 6, 5, 4];
        let mut tfp = packet::tfp_packet([0xbb; 6], node_addr, &inner);
        // the builder writes downward; flip to an upward response
        let mut outer_bytes = [0u8; MESH_HEADER_LENGTH];
        outer_bytes.copy_from_slice(&tfp[..MESH_HEADER_LENGTH]);
        let mut outer = MeshPacketHeader::from_bytes(&outer_bytes);
        outer.set_direction(packet::Direction::Upward);
        tfp[..MESH_HEADER_LENGTH].copy_from_slice(&outer.to_bytes());

        handle_frame(&mut h.daemon, session_id, outer, tfp);

        let stack = h.daemon.registry.get_mut(stack_id).unwrap();
        assert_eq!(
            stack.base().recipients.get(3255),
            Some(Recipient::from_address(node_addr))
        );
    }

    #[tokio::test]
    async fn length_mismatch_marks_cleanup() {
        let mut h = harness().await;
        let session_id = h.daemon.mesh_sessions[0].id;

        let (header, bytes) = hello_frame(true, [0xaa; 6], [0xbb; 6]);
        handle_frame(&mut h.daemon, session_id, header, bytes);

        // outer claims 8 inner bytes but delivers garbage length
        let outer = MeshPacketHeader::new(
            packet::Direction::Upward,
            false,
            packet::PROTOCOL_BINARY,
            (MESH_HEADER_LENGTH + 8) as u16,
            [0xbb; 6],
            [0xaa; 6],
            MeshPacketType::Tfp,
        );
        let mut bytes = outer.to_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]); // all-zero TFP header is invalid

        handle_frame(&mut h.daemon, session_id, outer, bytes);

        assert!(h.daemon.mesh_sessions[0].wants_cleanup());
    }

    #[tokio::test]
    async fn reconnecting_root_replaces_the_old_session() {
        let mut h = harness().await;
        let first_id = h.daemon.mesh_sessions[0].id;

        let (header, bytes) = hello_frame(true, [0xaa; 6], [0xbb; 6]);
        handle_frame(&mut h.daemon, first_id, header, bytes);

        // second connection from the same root address
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _peer2 = TcpStream::connect(addr).await.unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();

        let mut ops = h.reactor.ops();
        create_session(&mut h.daemon, &mut ops, stream, peer_addr);
        let second_id = h.daemon.mesh_sessions[1].id;

        let (header, bytes) = hello_frame(true, [0xaa; 6], [0xbb; 6]);
        handle_frame(&mut h.daemon, second_id, header, bytes);

        let first = h
            .daemon
            .mesh_sessions
            .iter()
            .find(|s| s.id == first_id)
            .unwrap();
        assert!(first.wants_cleanup());

        let second = h
            .daemon
            .mesh_sessions
            .iter()
            .find(|s| s.id == second_id)
            .unwrap();
        assert!(!second.wants_cleanup());
        assert_eq!(second.state, MeshSessionState::Operational);
    }

    #[tokio::test]
    async fn tfp_before_operational_is_dropped() {
        let mut h = harness().await;
        let session_id = h.daemon.mesh_sessions[0].id;

        let outer = MeshPacketHeader::new(
            packet::Direction::Upward,
            false,
            packet::PROTOCOL_BINARY,
            (MESH_HEADER_LENGTH + 8) as u16,
            [0xbb; 6],
            [0xaa; 6],
            MeshPacketType::Tfp,
        );
        let mut bytes = outer.to_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);

        handle_frame(&mut h.daemon, session_id, outer, bytes);

        // dropped without consequences
        assert!(!h.daemon.mesh_sessions[0].wants_cleanup());
        assert_eq!(h.daemon.registry.len(), 0);
    }
}
