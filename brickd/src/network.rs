//! Listeners and per-connection plumbing: plain TCP and WebSocket API
//! clients plus the mesh gateway port. Accept loops and socket I/O run as
//! tasks; session state changes happen on the event loop.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::client::{ClientEvent, ClientId, ClientSession, PacketAssembler};
use crate::daemon::Daemon;
use crate::mesh;
use crate::reactor::{Callback, Notifier, Ops, SourceKind, SourceQueue};
use crate::websocket;

/// Bind a TCP listener the way the config asks for it, including optional
/// IPv6 dual-stack operation.
pub fn bind_listener(address: &str, port: u16, dual_stack: bool) -> anyhow::Result<TcpListener> {
    let ip: IpAddr = address
        .parse()
        .with_context(|| format!("invalid listen address {address}"))?;
    let addr = SocketAddr::new(ip, port);

    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .context("could not create listen socket")?;
    socket
        .set_reuse_address(true)
        .context("could not configure listen socket")?;

    if addr.is_ipv6() {
        socket
            .set_only_v6(!dual_stack)
            .context("could not configure dual-stack mode")?;
    }

    socket
        .bind(&addr.into())
        .with_context(|| format!("could not bind to {addr}"))?;
    socket.listen(128).context("could not listen")?;
    socket
        .set_nonblocking(true)
        .context("could not configure listen socket")?;

    TcpListener::from_std(socket.into()).context("could not hand listen socket to the runtime")
}

/// Bind and register everything the config enables. Bind failures are
/// fatal: a daemon that silently listens nowhere helps nobody.
pub fn setup_listeners(daemon: &mut Daemon, ops: &mut Ops<Daemon>) -> anyhow::Result<()> {
    let listen = daemon.config.listen.clone();

    let plain = bind_listener(&listen.address, listen.plain_port, listen.dual_stack)?;
    info!(
        "Listening for plain clients on {}:{}",
        listen.address, listen.plain_port
    );
    register_plain_listener(daemon, ops, plain);

    if listen.websocket_port != 0 {
        let websocket = bind_listener(&listen.address, listen.websocket_port, listen.dual_stack)?;
        info!(
            "Listening for WebSocket clients on {}:{}",
            listen.address, listen.websocket_port
        );
        register_websocket_listener(daemon, ops, websocket);
    }

    if listen.mesh_gateway_port != 0 {
        let mesh = bind_listener(&listen.address, listen.mesh_gateway_port, listen.dual_stack)?;
        info!(
            "Listening for mesh stacks on {}:{}",
            listen.address, listen.mesh_gateway_port
        );
        register_mesh_listener(daemon, ops, mesh);
    }

    Ok(())
}

pub fn register_plain_listener(daemon: &mut Daemon, ops: &mut Ops<Daemon>, listener: TcpListener) {
    let accepted: SourceQueue<(TcpStream, SocketAddr)> = SourceQueue::new();

    let source = ops.add_source(
        "server-plain",
        SourceKind::Generic,
        plain_accept_callback(accepted.clone()),
    );
    let notifier = daemon.handle.notifier(source);

    tokio::spawn(accept_loop(listener, accepted, notifier));
}

fn plain_accept_callback(accepted: SourceQueue<(TcpStream, SocketAddr)>) -> Callback<Daemon> {
    Box::new(move |daemon, ops| {
        if let Some((stream, peer)) = accepted.pop() {
            create_plain_client(daemon, ops, stream, peer);
        }

        Ok(())
    })
}

pub fn register_websocket_listener(
    daemon: &mut Daemon,
    ops: &mut Ops<Daemon>,
    listener: TcpListener,
) {
    let accepted: SourceQueue<(WebSocketStream<TcpStream>, SocketAddr)> = SourceQueue::new();

    let source = ops.add_source(
        "server-websocket",
        SourceKind::Generic,
        websocket_accept_callback(accepted.clone()),
    );
    let notifier = daemon.handle.notifier(source);

    tokio::spawn(websocket_accept_loop(listener, accepted, notifier));
}

fn websocket_accept_callback(
    accepted: SourceQueue<(WebSocketStream<TcpStream>, SocketAddr)>,
) -> Callback<Daemon> {
    Box::new(move |daemon, ops| {
        if let Some((stream, peer)) = accepted.pop() {
            create_websocket_client(daemon, ops, stream, peer);
        }

        Ok(())
    })
}

pub fn register_mesh_listener(daemon: &mut Daemon, ops: &mut Ops<Daemon>, listener: TcpListener) {
    let accepted: SourceQueue<(TcpStream, SocketAddr)> = SourceQueue::new();

    let source = ops.add_source(
        "server-mesh",
        SourceKind::Generic,
        mesh_accept_callback(accepted.clone()),
    );
    let notifier = daemon.handle.notifier(source);

    tokio::spawn(accept_loop(listener, accepted, notifier));
}

fn mesh_accept_callback(accepted: SourceQueue<(TcpStream, SocketAddr)>) -> Callback<Daemon> {
    Box::new(move |daemon, ops| {
        if let Some((stream, peer)) = accepted.pop() {
            info!("Accepted mesh connection from {peer}");
            mesh::create_session(daemon, ops, stream, peer);
        }

        Ok(())
    })
}

async fn accept_loop(
    listener: TcpListener,
    accepted: SourceQueue<(TcpStream, SocketAddr)>,
    notifier: Notifier,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                accepted.push((stream, peer));

                if !notifier.notify() {
                    return;
                }
            }
            Err(error) => {
                warn!("Could not accept connection: {error}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn websocket_accept_loop(
    listener: TcpListener,
    accepted: SourceQueue<(WebSocketStream<TcpStream>, SocketAddr)>,
    notifier: Notifier,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                // the upgrade handshake must not block the accept loop
                let accepted = accepted.clone();
                let notifier = notifier.clone();

                tokio::spawn(async move {
                    match websocket::accept(stream).await {
                        Ok(websocket) => {
                            accepted.push((websocket, peer));
                            notifier.notify();
                        }
                        Err(error) => {
                            debug!("WebSocket handshake with {peer} failed: {error:#}");
                        }
                    }
                });
            }
            Err(error) => {
                warn!("Could not accept WebSocket connection: {error}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

fn create_plain_client(
    daemon: &mut Daemon,
    ops: &mut Ops<Daemon>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();

    let id = daemon.allocate_client_id();
    let name = format!("{peer} (plain)");

    let events: SourceQueue<ClientEvent> = SourceQueue::new();
    let source = ops.add_source(
        format!("client-{name}"),
        SourceKind::Generic,
        client_callback(id, events.clone()),
    );
    let notifier = daemon.handle.notifier(source);

    let backlog = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::unbounded_channel();

    let tasks = vec![
        tokio::spawn(plain_reader(read_half, events, notifier)),
        tokio::spawn(plain_writer(write_half, rx, Arc::clone(&backlog))),
    ];

    daemon.clients.push(ClientSession::new(
        id,
        name.clone(),
        source,
        daemon.secret.is_some(),
        tx,
        backlog,
        Arc::clone(&daemon.metrics),
        tasks,
    ));
    daemon.metrics.client_connected();

    info!("Accepted client {name}");
}

fn create_websocket_client(
    daemon: &mut Daemon,
    ops: &mut Ops<Daemon>,
    stream: WebSocketStream<TcpStream>,
    peer: SocketAddr,
) {
    let (sink, source_stream) = stream.split();

    let id = daemon.allocate_client_id();
    let name = format!("{peer} (websocket)");

    let events: SourceQueue<ClientEvent> = SourceQueue::new();
    let source = ops.add_source(
        format!("client-{name}"),
        SourceKind::Generic,
        client_callback(id, events.clone()),
    );
    let notifier = daemon.handle.notifier(source);

    let backlog = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::unbounded_channel();

    let tasks = vec![
        tokio::spawn(websocket_reader(source_stream, events, notifier)),
        tokio::spawn(websocket_writer(sink, rx, Arc::clone(&backlog))),
    ];

    daemon.clients.push(ClientSession::new(
        id,
        name.clone(),
        source,
        daemon.secret.is_some(),
        tx,
        backlog,
        Arc::clone(&daemon.metrics),
        tasks,
    ));
    daemon.metrics.client_connected();

    info!("Accepted client {name}");
}

fn client_callback(id: ClientId, events: SourceQueue<ClientEvent>) -> Callback<Daemon> {
    Box::new(move |daemon, _ops| {
        if let Some(event) = events.pop() {
            daemon.handle_client_event(id, event);
        }

        Ok(())
    })
}

async fn plain_reader(
    mut read_half: OwnedReadHalf,
    events: SourceQueue<ClientEvent>,
    notifier: Notifier,
) {
    let mut assembler = PacketAssembler::new();

    let disconnect = |reason: String| {
        events.push(ClientEvent::Disconnected(reason));
        notifier.notify();
    };

    loop {
        match read_half.read_buf(assembler.buffer_mut()).await {
            Ok(0) => {
                disconnect("disconnected by peer".to_string());
                return;
            }
            Ok(_) => {}
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => {
                disconnect(format!("receive error: {error}"));
                return;
            }
        }

        loop {
            match assembler.next_packet() {
                Ok(Some(packet)) => {
                    events.push(ClientEvent::Request(packet));

                    if !notifier.notify() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(reason) => {
                    disconnect(format!("invalid request: {reason}"));
                    return;
                }
            }
        }
    }
}

async fn plain_writer(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    backlog: Arc<AtomicUsize>,
) {
    while let Some(bytes) = rx.recv().await {
        let result = write_half.write_all(&bytes).await;
        backlog.fetch_sub(bytes.len(), Ordering::Relaxed);

        if result.is_err() {
            break;
        }
    }
}

async fn websocket_reader(
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    events: SourceQueue<ClientEvent>,
    notifier: Notifier,
) {
    let mut assembler = PacketAssembler::new();

    let disconnect = |reason: String| {
        events.push(ClientEvent::Disconnected(reason));
        notifier.notify();
    };

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(payload)) => {
                if payload.len() > websocket::MAX_FRAME_PAYLOAD {
                    disconnect(format!("oversized WebSocket frame ({})", payload.len()));
                    return;
                }

                // a WebSocket frame may carry a partial TFP packet; the
                // byte stream semantics are the same as for plain TCP
                assembler.extend(&payload);

                loop {
                    match assembler.next_packet() {
                        Ok(Some(packet)) => {
                            events.push(ClientEvent::Request(packet));

                            if !notifier.notify() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(reason) => {
                            disconnect(format!("invalid request: {reason}"));
                            return;
                        }
                    }
                }
            }
            Ok(Message::Close(_)) => {
                disconnect("close frame".to_string());
                return;
            }
            // pings are answered by the library during the next flush
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(other) => {
                disconnect(format!("unsupported WebSocket opcode ({other:?})"));
                return;
            }
            Err(error) => {
                disconnect(format!("receive error: {error}"));
                return;
            }
        }
    }

    disconnect("disconnected by peer".to_string());
}

async fn websocket_writer(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    backlog: Arc<AtomicUsize>,
) {
    while let Some(bytes) = rx.recv().await {
        let length = bytes.len();
        let result = sink.send(Message::Binary(bytes)).await;
        backlog.fetch_sub(length, Ordering::Relaxed);

        if result.is_err() {
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
    use tfp::packet::{function, UID_BRICK_DAEMON};
    use tfp::{ErrorCode, Header, Packet};

    #[tokio::test]
    async fn bind_listener_v4_and_v6() {
        let v4 = bind_listener("127.0.0.1", 0, false).unwrap();
        assert!(v4.local_addr().unwrap().is_ipv4());

        let v6 = bind_listener("::1", 0, false).unwrap();
        assert!(v6.local_addr().unwrap().is_ipv6());

        assert!(bind_listener("not-an-address", 0, false).is_err());
    }

    #[tokio::test]
    async fn plain_client_gets_a_daemon_reply_end_to_end() {
        let listener = bind_listener("127.0.0.1", 0, false).unwrap();
        let addr = listener.local_addr().unwrap();

        let mut reactor: Reactor<Daemon> = Reactor::new();
        let handle = reactor.handle();
        let mut daemon = Daemon::new(
            Arc::new(Config::default()),
            Arc::new(Metrics::new()),
            handle.clone(),
        );

        let mut ops = reactor.ops();
        register_plain_listener(&mut daemon, &mut ops, listener);
        reactor.apply(ops);

        let loop_task = tokio::spawn(async move {
            reactor
                .run(&mut daemon, |daemon, ops| daemon.cleanup(ops))
                .await
                .unwrap();
        });

        // authentication is disabled, so GetAuthenticationNonce must be
        // answered with function-not-supported
        let mut header = Header {
            uid: UID_BRICK_DAEMON,
            length: 8,
            function_id: function::GET_AUTHENTICATION_NONCE,
            sequence_number_and_options: 0,
            error_code_and_future_use: 0,
        };
        header.set_sequence_number(1);
        header.set_response_expected(true);
        let request = Packet::from_header(header);

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&request.to_bytes()).await.unwrap();

        let mut reply = [0u8; 8];
        stream.read_exact(&mut reply).await.unwrap();
        let reply = Packet::parse(&reply).unwrap();

        assert_eq!(reply.header.uid, UID_BRICK_DAEMON);
        assert_eq!(
            reply.header.function_id,
            function::GET_AUTHENTICATION_NONCE
        );
        assert_eq!(reply.header.error_code(), ErrorCode::FunctionNotSupported);

        handle.stop();
        loop_task.await.unwrap();
    }
}
