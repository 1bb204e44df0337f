//! Request fan-out and response fan-in between clients and stacks.

use log::{debug, error};

use tfp::packet::function;
use tfp::{EnumerationType, Packet};

use crate::client::ClientId;
use crate::daemon::Daemon;
use crate::hardware::StackId;
use crate::stack::{DispatchResult, Stack};

/// Route a validated client request to the stacks.
///
/// UID 0 is a broadcast offered to every stack. A directed request goes to
/// the first stack whose recipient table claims the UID; a UID no stack
/// knows yet is broadcast as well, since the device may simply not have
/// enumerated so far.
pub fn dispatch_request(daemon: &mut Daemon, client_id: ClientId, request: &Packet) {
    if request.header.uid == 0 {
        let accepted = broadcast_request(daemon, request);
        debug!(
            "Broadcast request ({}) to {} stack(s)",
            request.request_signature(),
            accepted
        );
    } else {
        let mut owned = false;

        for (_, stack) in daemon.registry.iter_mut() {
            let Some(recipient) = stack.base().recipients.get(request.header.uid) else {
                continue;
            };

            owned = true;

            match stack.dispatch(request, Some(recipient)) {
                DispatchResult::Accepted => {
                    debug!(
                        "Sent request ({}) to stack {}",
                        request.request_signature(),
                        stack.name()
                    );
                }
                DispatchResult::Dropped => {
                    debug!(
                        "Stack {} dropped directed request ({})",
                        stack.name(),
                        request.request_signature()
                    );
                }
                DispatchResult::Error(message) => {
                    error!(
                        "Could not send request ({}) to stack {}: {}",
                        request.request_signature(),
                        stack.name(),
                        message
                    );
                }
            }

            break;
        }

        if !owned {
            let accepted = broadcast_request(daemon, request);
            debug!(
                "No stack knows UID of request ({}) yet, broadcast to {} stack(s)",
                request.request_signature(),
                accepted
            );
        }
    }

    if request.header.response_expected() {
        if let Some(session) = daemon.client_mut(client_id) {
            session.add_pending(request.header);
        }
    }
}

fn broadcast_request(daemon: &mut Daemon, request: &Packet) -> usize {
    let mut accepted = 0;

    for (_, stack) in daemon.registry.iter_mut() {
        match stack.dispatch(request, None) {
            DispatchResult::Accepted => accepted += 1,
            DispatchResult::Dropped => {}
            DispatchResult::Error(message) => {
                error!(
                    "Could not broadcast request ({}) to stack {}: {}",
                    request.request_signature(),
                    stack.name(),
                    message
                );
            }
        }
    }

    accepted
}

/// Deliver a response or callback coming up from a stack (or a synthetic
/// one, `origin = None`) to the clients.
pub fn dispatch_response(daemon: &mut Daemon, origin: Option<StackId>, response: &Packet) {
    // enumerate callbacks drive the routing tables
    if response.header.function_id == function::CALLBACK_ENUMERATE {
        if let (Some(stack_id), Some(subtype)) = (origin, tfp::enumerate::callback_subtype(response))
        {
            if let Some(stack) = daemon.registry.get_mut(stack_id) {
                match subtype {
                    EnumerationType::Available | EnumerationType::Connected => {
                        // keep a route the transport may have stored already
                        stack.base_mut().recipients.add_if_missing(response.header.uid);
                    }
                    EnumerationType::Disconnected => {
                        stack.base_mut().recipients.remove(response.header.uid);
                    }
                    EnumerationType::Unknown(value) => {
                        debug!(
                            "Ignoring enumerate callback with unknown type {} ({})",
                            value,
                            response.callback_signature()
                        );
                    }
                }
            }
        }
    }

    if response.header.sequence_number() == 0 {
        // callback: every authenticated client gets it, slow ones are
        // skipped (responses are never skipped)
        daemon.metrics.inc_callbacks();

        let metrics = std::sync::Arc::clone(&daemon.metrics);

        for session in daemon.clients.iter_mut().filter(|s| !s.dead) {
            if !session.authenticated() {
                continue;
            }

            if session.is_slow() {
                metrics.inc_callbacks_dropped_slow_client();
                debug!(
                    "Dropping callback ({}) for slow client {}",
                    response.callback_signature(),
                    session.name
                );
                continue;
            }

            session.send_packet(response);
        }
    } else {
        // response: deliver to exactly the client with the matching
        // pending request
        daemon.metrics.inc_responses();

        for session in daemon.clients.iter_mut().filter(|s| !s.dead) {
            if session.take_matching_pending(response) {
                debug!(
                    "Sending response ({}) to client {}",
                    response.response_signature(),
                    session.name
                );
                session.send_packet(response);
                return;
            }
        }

        debug!(
            "No client is waiting for response ({})",
            response.response_signature()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientSession, PENDING_REQUEST_EXPIRY};
    use crate::stack::testing::MockStack;
    use crate::stack::Recipient;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tfp::{ErrorCode, Header};
    use tokio::sync::mpsc;

    fn test_daemon() -> Daemon {
        let reactor: crate::reactor::Reactor<Daemon> = crate::reactor::Reactor::new();
        Daemon::new(
            Arc::new(crate::config::Config::default()),
            Arc::new(crate::metrics::Metrics::new()),
            reactor.handle(),
        )
    }

    fn add_client(daemon: &mut Daemon) -> (ClientId, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = daemon.allocate_client_id();
        let session = ClientSession::new(
            id,
            format!("client-{id}"),
            0,
            false,
            tx,
            Arc::new(AtomicUsize::new(0)),
            Arc::clone(&daemon.metrics),
            Vec::new(),
        );
        daemon.clients.push(session);
        (id, rx)
    }

    fn request(uid: u32, function_id: u8, sequence_number: u8) -> Packet {
        let mut header = Header {
            uid,
            length: 8,
            function_id,
            sequence_number_and_options: 0,
            error_code_and_future_use: 0,
        };
        header.set_sequence_number(sequence_number);
        header.set_response_expected(true);
        Packet::from_header(header)
    }

    #[tokio::test]
    async fn directed_request_goes_to_first_owning_stack() {
        let mut daemon = test_daemon();
        let (client, _rx) = add_client(&mut daemon);

        let without_uid = MockStack::new("without-uid");
        let without_uid_log = without_uid.log_handle();
        daemon.registry.add(Box::new(without_uid));

        let with_uid = MockStack::new("with-uid").with_uid(0x0102_0304);
        let with_uid_log = with_uid.log_handle();
        let owner = daemon.registry.add(Box::new(with_uid));

        let packet = request(0x0102_0304, 7, 1);
        dispatch_request(&mut daemon, client, &packet);

        assert_eq!(without_uid_log.lock().unwrap().len(), 0);
        assert_eq!(with_uid_log.lock().unwrap().len(), 1);
        assert!(with_uid_log.lock().unwrap()[0].1.is_some());

        let stack = daemon.registry.get_mut(owner).unwrap();
        assert!(stack.base().recipients.contains(0x0102_0304));

        assert_eq!(daemon.client_mut(client).unwrap().pending_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_offers_request_to_every_stack() {
        let mut daemon = test_daemon();
        let (client, _rx) = add_client(&mut daemon);

        let a = MockStack::new("a");
        let a_log = a.log_handle();
        daemon.registry.add(Box::new(a));
        let b = MockStack::new("b");
        let b_log = b.log_handle();
        daemon.registry.add(Box::new(b));

        let packet = request(0, 7, 1);
        dispatch_request(&mut daemon, client, &packet);

        for log in [a_log, b_log] {
            let log = log.lock().unwrap();
            assert_eq!(log.len(), 1);
            assert_eq!(log[0].1, None);
        }
    }

    #[tokio::test]
    async fn response_reaches_only_the_matching_client() {
        let mut daemon = test_daemon();
        let (first, mut first_rx) = add_client(&mut daemon);
        let (second, mut second_rx) = add_client(&mut daemon);

        let packet = request(0x0102_0304, 7, 1);
        daemon
            .client_mut(first)
            .unwrap()
            .add_pending(packet.header);

        dispatch_response(&mut daemon, None, &packet);

        assert!(first_rx.try_recv().is_ok());
        assert!(second_rx.try_recv().is_err());
        assert_eq!(daemon.client_mut(first).unwrap().pending_count(), 0);
        let _ = second;
    }

    #[tokio::test]
    async fn callback_reaches_every_client() {
        let mut daemon = test_daemon();
        let (_, mut first_rx) = add_client(&mut daemon);
        let (_, mut second_rx) = add_client(&mut daemon);

        let callback = tfp::enumerate::disconnected_callback(42);
        dispatch_response(&mut daemon, None, &callback);

        assert!(first_rx.try_recv().is_ok());
        assert!(second_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn slow_client_misses_callbacks_but_not_responses() {
        let mut daemon = test_daemon();
        let (client, mut rx) = add_client(&mut daemon);

        daemon
            .client_mut(client)
            .unwrap()
            .backlog
            .store(crate::client::SEND_BACKLOG_HIGH_WATER + 1, std::sync::atomic::Ordering::Relaxed);

        let callback = tfp::enumerate::disconnected_callback(42);
        dispatch_response(&mut daemon, None, &callback);
        assert!(rx.try_recv().is_err());
        assert_eq!(daemon.metrics.callbacks_dropped_slow_client(), 1);

        let packet = request(0x0102_0304, 7, 1);
        daemon.client_mut(client).unwrap().add_pending(packet.header);
        dispatch_response(&mut daemon, None, &packet);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn expired_pending_request_is_discarded() {
        let mut daemon = test_daemon();
        let (client, mut rx) = add_client(&mut daemon);

        let packet = request(0x0102_0304, 7, 1);
        daemon.client_mut(client).unwrap().add_pending(packet.header);

        tokio::time::pause();
        tokio::time::advance(PENDING_REQUEST_EXPIRY + std::time::Duration::from_millis(1)).await;

        dispatch_response(&mut daemon, None, &packet);
        assert!(rx.try_recv().is_err());
        assert_eq!(daemon.client_mut(client).unwrap().pending_count(), 0);
    }

    #[tokio::test]
    async fn enumerate_callbacks_update_the_recipient_table() {
        let mut daemon = test_daemon();
        let stack_id = daemon.registry.add(Box::new(MockStack::new("stack")));

        let mut connected = tfp::enumerate::disconnected_callback(42);
        let mut ec = tfp::EnumerateCallback::parse(&connected).unwrap();
        ec.enumeration_type = EnumerationType::Connected;
        ec.store(&mut connected);

        dispatch_response(&mut daemon, Some(stack_id), &connected);
        assert!(daemon
            .registry
            .get_mut(stack_id)
            .unwrap()
            .base()
            .recipients
            .contains(42));

        let disconnected = tfp::enumerate::disconnected_callback(42);
        dispatch_response(&mut daemon, Some(stack_id), &disconnected);
        assert!(!daemon
            .registry
            .get_mut(stack_id)
            .unwrap()
            .base()
            .recipients
            .contains(42));
    }

    #[tokio::test]
    async fn router_preserves_transport_supplied_routes() {
        let mut daemon = test_daemon();
        let stack_id = daemon.registry.add(Box::new(MockStack::new("mesh")));

        daemon
            .registry
            .get_mut(stack_id)
            .unwrap()
            .base_mut()
            .recipients
            .add(42, Recipient::from_address([9; 6]));

        let mut connected = tfp::enumerate::disconnected_callback(42);
        let mut ec = tfp::EnumerateCallback::parse(&connected).unwrap();
        ec.enumeration_type = EnumerationType::Connected;
        ec.store(&mut connected);

        dispatch_response(&mut daemon, Some(stack_id), &connected);

        assert_eq!(
            daemon
                .registry
                .get_mut(stack_id)
                .unwrap()
                .base()
                .recipients
                .get(42),
            Some(Recipient::from_address([9; 6]))
        );
    }

    #[tokio::test]
    async fn unauthenticated_request_is_rejected_with_error() {
        let mut daemon = test_daemon();
        daemon.secret = Some("s3cret".to_string());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = daemon.allocate_client_id();
        let session = ClientSession::new(
            id,
            "strict".to_string(),
            0,
            true,
            tx,
            Arc::new(AtomicUsize::new(0)),
            Arc::clone(&daemon.metrics),
            Vec::new(),
        );
        daemon.clients.push(session);

        let packet = request(0x0102_0304, 7, 1);
        daemon.handle_client_event(id, crate::client::ClientEvent::Request(packet));

        let reply = Packet::parse(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(reply.header.error_code(), ErrorCode::FunctionNotSupported);
        assert_eq!(reply.header.function_id, 7);
    }
}
