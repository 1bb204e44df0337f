//! Central daemon state. Everything here is owned by the event loop and
//! only mutated from source callbacks and the cleanup pass.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use log::{debug, info};

use tfp::Packet;

use crate::bricklet::SpiPortControl;
use crate::client::{ClientEvent, ClientId, ClientSession};
use crate::config::Config;
use crate::hardware::Registry;
use crate::mesh::stack::MeshSession;
use crate::metrics::Metrics;
use crate::reactor::{Ops, ReactorHandle};
use crate::router;
use crate::stack::Stack;
use crate::usb::UsbDeviceEntry;

pub struct Daemon {
    pub config: Arc<Config>,
    pub secret: Option<String>,
    pub metrics: Arc<Metrics>,
    pub handle: ReactorHandle,
    pub registry: Registry,
    pub clients: Vec<ClientSession>,
    pub mesh_sessions: Vec<MeshSession>,
    pub usb_devices: Vec<UsbDeviceEntry>,
    pub spi_ports: Vec<SpiPortControl>,
    /// UID of a HAT if one enumerated; rewrites the connected-uid of
    /// Bricklet enumerates.
    pub connected_uid: Arc<AtomicU32>,
    next_client_id: ClientId,
    next_mesh_session_id: u64,
}

impl Daemon {
    pub fn new(config: Arc<Config>, metrics: Arc<Metrics>, handle: ReactorHandle) -> Self {
        let secret = config.secret().map(|s| s.to_string());

        Self {
            config,
            secret,
            metrics,
            handle,
            registry: Registry::new(),
            clients: Vec::new(),
            mesh_sessions: Vec::new(),
            usb_devices: Vec::new(),
            spi_ports: Vec::new(),
            connected_uid: Arc::new(AtomicU32::new(0)),
            next_client_id: 0,
            next_mesh_session_id: 0,
        }
    }

    pub fn allocate_client_id(&mut self) -> ClientId {
        let id = self.next_client_id;
        self.next_client_id += 1;
        id
    }

    pub fn allocate_mesh_session_id(&mut self) -> u64 {
        let id = self.next_mesh_session_id;
        self.next_mesh_session_id += 1;
        id
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut ClientSession> {
        self.clients.iter_mut().find(|session| session.id == id)
    }

    pub fn mesh_session_mut(&mut self, id: u64) -> Option<&mut MeshSession> {
        self.mesh_sessions
            .iter_mut()
            .find(|session| session.id == id)
    }

    /// Entry point for everything a client connection produces.
    pub fn handle_client_event(&mut self, client_id: ClientId, event: ClientEvent) {
        match event {
            ClientEvent::Request(packet) => {
                self.metrics.inc_requests();

                let secret = &self.secret;
                let Some(session) = self
                    .clients
                    .iter_mut()
                    .find(|session| session.id == client_id)
                else {
                    return;
                };

                debug!(
                    "Got request ({}) from client {}",
                    packet.request_signature(),
                    session.name
                );

                if crate::client::is_daemon_request(&packet) {
                    session.handle_daemon_request(secret.as_deref(), &packet);
                    return;
                }

                if !session.authenticated() {
                    debug!(
                        "Client {} is not authenticated, rejecting request ({})",
                        session.name,
                        packet.request_signature()
                    );
                    self.metrics.inc_invalid_requests();
                    session.send_error_response(&packet, tfp::ErrorCode::FunctionNotSupported);
                    return;
                }

                router::dispatch_request(self, client_id, &packet);
            }
            ClientEvent::Disconnected(reason) => {
                if let Some(session) = self.client_mut(client_id) {
                    info!("Client {} disconnected ({})", session.name, reason);
                    session.dead = true;
                }
            }
        }
    }

    /// Per-iteration cleanup hook of the event loop: prune dead clients,
    /// destroy mesh sessions flagged for cleanup, compact the registry and
    /// announce disconnects for the removed stacks.
    pub fn cleanup(&mut self, ops: &mut Ops<Daemon>) {
        let mut index = 0;
        while index < self.clients.len() {
            if self.clients[index].dead {
                let mut session = self.clients.remove(index);
                debug!("Releasing client {}", session.name);
                ops.remove_source(session.source);
                session.abort_tasks();
                self.metrics.client_disconnected();
            } else {
                index += 1;
            }
        }

        crate::mesh::cleanup_sessions(self, ops);

        for (_, stack) in self.registry.take_marked() {
            info!("Releasing stack {}", stack.name());

            self.announce_disconnect(stack.base().recipients.uids());
            self.metrics.stack_removed();
        }
    }

    /// Emit one synthetic enumerate-disconnected callback per UID, as a
    /// destroyed stack does for every device it knew.
    pub fn announce_disconnect(&mut self, uids: Vec<u32>) {
        for uid in uids {
            let callback = tfp::enumerate::disconnected_callback(uid);
            router::dispatch_response(self, None, &callback);
        }
    }

    /// Hand a response from a transport into the router. Exists so source
    /// callbacks don't have to know the router's shape.
    pub fn dispatch_response(&mut self, origin: Option<crate::hardware::StackId>, packet: &Packet) {
        router::dispatch_response(self, origin, packet);
    }

    /// Stop the SPI workers and wait for them with a bounded deadline.
    /// Client and transport tasks die with their sessions when the daemon
    /// is dropped.
    pub async fn shutdown(mut self) {
        for port in &mut self.spi_ports {
            port.stop();
        }

        let ports = std::mem::take(&mut self.spi_ports);
        for port in ports {
            port.join().await;
        }

        info!("Brick Daemon exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use crate::stack::testing::MockStack;
    use crate::stack::{Recipient, Stack as _};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn test_daemon() -> Daemon {
        let reactor: Reactor<Daemon> = Reactor::new();
        Daemon::new(
            Arc::new(Config::default()),
            Arc::new(Metrics::new()),
            reactor.handle(),
        )
    }

    #[tokio::test]
    async fn removed_stack_announces_disconnect_for_every_uid() {
        let mut daemon = test_daemon();

        let mut stack = MockStack::new("gone");
        stack
            .base_mut()
            .recipients
            .add(1, Recipient::default());
        stack
            .base_mut()
            .recipients
            .add(2, Recipient::default());
        let stack_id = daemon.registry.add(Box::new(stack));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client_id = daemon.allocate_client_id();
        daemon.clients.push(ClientSession::new(
            client_id,
            "watcher".to_string(),
            0,
            false,
            tx,
            Arc::new(AtomicUsize::new(0)),
            Arc::clone(&daemon.metrics),
            Vec::new(),
        ));

        daemon.registry.mark_for_removal(stack_id);

        let reactor: Reactor<Daemon> = Reactor::new();
        let mut ops = reactor.ops();
        daemon.cleanup(&mut ops);

        let mut disconnected_uids = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            let packet = Packet::parse(&bytes).unwrap();
            assert_eq!(
                tfp::enumerate::callback_subtype(&packet),
                Some(tfp::EnumerationType::Disconnected)
            );
            disconnected_uids.push(packet.header.uid);
        }

        disconnected_uids.sort_unstable();
        assert_eq!(disconnected_uids, vec![1, 2]);
        assert_eq!(daemon.registry.len(), 0);
    }

    #[tokio::test]
    async fn dead_clients_are_pruned_in_cleanup() {
        let mut daemon = test_daemon();

        let (tx, _rx) = mpsc::unbounded_channel();
        let client_id = daemon.allocate_client_id();
        daemon.metrics.client_connected();
        daemon.clients.push(ClientSession::new(
            client_id,
            "doomed".to_string(),
            0,
            false,
            tx,
            Arc::new(AtomicUsize::new(0)),
            Arc::clone(&daemon.metrics),
            Vec::new(),
        ));

        daemon
            .handle_client_event(client_id, ClientEvent::Disconnected("test".to_string()));

        let reactor: Reactor<Daemon> = Reactor::new();
        let mut ops = reactor.ops();
        daemon.cleanup(&mut ops);

        assert!(daemon.clients.is_empty());
        assert_eq!(daemon.metrics.clients_connected(), 0);
    }
}
