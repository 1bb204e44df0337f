//! One USB-attached Brick: read transfers that perpetually re-submit
//! themselves, a small pool of write slots and a bounded overflow queue
//! that evicts its oldest entry under pressure.

use std::collections::VecDeque;

use anyhow::Context;
use log::{debug, error, info, warn};
use nusb::transfer::{RequestBuffer, TransferError};
use nusb::{DeviceInfo, Interface};
use tokio::sync::mpsc;

use tfp::packet::HEADER_SIZE;
use tfp::{Header, Packet};

use crate::daemon::Daemon;
use crate::hardware::StackId;
use crate::reactor::{Callback, Notifier, Ops, SourceKind, SourceQueue};
use crate::stack::{DispatchResult, Recipient, Stack, StackBase};
use crate::usb::UsbDeviceEntry;

pub const USB_INTERFACE: u8 = 0;

/// The Brick firmware exposes one fixed bulk endpoint pair.
pub const ENDPOINT_IN: u8 = 0x84;
pub const ENDPOINT_OUT: u8 = 0x04;

pub const MAX_READ_TRANSFERS: usize = 5;
pub const MAX_WRITE_TRANSFERS: usize = 5;
pub const MAX_QUEUED_WRITES: usize = 256;

pub enum BrickEvent {
    Response(Packet),
    WriteDone,
}

/// The registry-facing side of one Brick.
pub struct BrickStack {
    base: StackBase,
    /// Bounded channel to the write pump; its capacity models the write
    /// transfer slots.
    tx: mpsc::Sender<Packet>,
    overflow: VecDeque<Packet>,
    metrics: std::sync::Arc<crate::metrics::Metrics>,
}

impl BrickStack {
    /// A completed write freed a slot: move the oldest queued request
    /// over, strictly FIFO.
    pub fn handle_write_done(&mut self) {
        if let Some(packet) = self.overflow.pop_front() {
            if let Err(mpsc::error::TrySendError::Full(packet)) = self.tx.try_send(packet) {
                self.overflow.push_front(packet);
            } else {
                info!(
                    "Handled queued request for {}, {} request(s) left in write queue",
                    self.base.name,
                    self.overflow.len()
                );
            }
        }
    }
}

impl Stack for BrickStack {
    fn base(&self) -> &StackBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StackBase {
        &mut self.base
    }

    fn dispatch(&mut self, request: &Packet, recipient: Option<Recipient>) -> DispatchResult {
        if request.header.uid != 0 && recipient.is_none() {
            return DispatchResult::Dropped;
        }

        match self.tx.try_send(*request) {
            Ok(()) => DispatchResult::Accepted,
            Err(mpsc::error::TrySendError::Full(request)) => {
                // all write slots busy: overflow, dropping the oldest entry
                // once the queue is full
                if self.overflow.len() >= MAX_QUEUED_WRITES {
                    warn!(
                        "Dropping {} item(s) from write queue of {}",
                        self.overflow.len() - MAX_QUEUED_WRITES + 1,
                        self.base.name
                    );

                    while self.overflow.len() >= MAX_QUEUED_WRITES {
                        self.overflow.pop_front();
                        self.metrics.inc_write_queue_evictions();
                    }
                }

                debug!(
                    "No free write transfer for {}, queued request (count: {})",
                    self.base.name,
                    self.overflow.len() + 1
                );

                self.overflow.push_back(request);
                DispatchResult::Accepted
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                DispatchResult::Error("write pump is gone".to_string())
            }
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Open a freshly attached Brick and wire it up. Failures are logged, not
/// fatal: the daemon keeps running for the other devices.
pub fn create(daemon: &mut Daemon, ops: &mut Ops<Daemon>, info: DeviceInfo) {
    let bus_number = info.bus_number();
    let device_address = info.device_address();

    if let Err(error) = create_inner(daemon, ops, info) {
        error!(
            "Could not create Brick from USB device (bus: {}, device: {}): {:#}",
            bus_number, device_address, error
        );
    }
}

fn create_inner(daemon: &mut Daemon, ops: &mut Ops<Daemon>, info: DeviceInfo) -> anyhow::Result<()> {
    debug!(
        "Creating Brick from USB device (bus: {}, device: {})",
        info.bus_number(),
        info.device_address()
    );

    let product = info.product_string().unwrap_or("<unknown>").to_string();
    let serial = info.serial_number().unwrap_or("<unknown>").to_string();
    let name = format!("{product} [{serial}]");

    let device = info.open().context("could not open USB device")?;

    if let Err(error) = device.reset() {
        warn!("Could not reset USB device of {name}: {error}");
    }

    let interface = device
        .claim_interface(USB_INTERFACE)
        .context("could not claim USB device interface")?;

    let events: SourceQueue<BrickEvent> = SourceQueue::new();
    let (tx, rx) = mpsc::channel(MAX_WRITE_TRANSFERS);

    let stack = BrickStack {
        base: StackBase::new(name.clone()),
        tx,
        overflow: VecDeque::new(),
        metrics: std::sync::Arc::clone(&daemon.metrics),
    };

    let stack_id = daemon.registry.add(Box::new(stack));
    daemon.metrics.stack_added();

    let source = ops.add_source(
        format!("brick-{serial}"),
        SourceKind::Generic,
        brick_callback(stack_id, events.clone(), name.clone()),
    );
    let notifier = daemon.handle.notifier(source);

    let tasks = vec![
        tokio::spawn(read_pump(
            interface.clone(),
            ENDPOINT_IN,
            events.clone(),
            notifier.clone(),
            name.clone(),
        )),
        tokio::spawn(write_pump(
            interface,
            ENDPOINT_OUT,
            rx,
            events,
            notifier,
            name.clone(),
        )),
    ];

    daemon.usb_devices.push(UsbDeviceEntry {
        device_id: info.id(),
        stack_id,
        source,
        tasks,
    });

    info!(
        "Added USB device (bus: {}, device: {}) at index {} as {}",
        info.bus_number(),
        info.device_address(),
        daemon.usb_devices.len() - 1,
        name
    );

    Ok(())
}

fn brick_callback(
    stack_id: StackId,
    events: SourceQueue<BrickEvent>,
    name: String,
) -> Callback<Daemon> {
    Box::new(move |daemon, _ops| {
        match events.pop() {
            Some(BrickEvent::Response(packet)) => {
                // remember every UID that ever answered through this Brick
                if let Some(stack) = daemon.registry.get_mut(stack_id) {
                    stack.base_mut().recipients.add_if_missing(packet.header.uid);
                }

                if packet.header.sequence_number() == 0 {
                    debug!(
                        "Got {} ({}) from {}",
                        tfp::enumerate::callback_subtype(&packet)
                            .map(|subtype| subtype.label())
                            .unwrap_or("callback"),
                        packet.callback_signature(),
                        name
                    );
                } else {
                    debug!(
                        "Got response ({}) from {}",
                        packet.response_signature(),
                        name
                    );
                }

                daemon.dispatch_response(Some(stack_id), &packet);
            }
            Some(BrickEvent::WriteDone) => {
                if let Some(stack) = daemon.registry.get_mut(stack_id) {
                    if let Some(brick) = stack.as_any_mut().downcast_mut::<BrickStack>() {
                        brick.handle_write_done();
                    }
                }
            }
            None => {
                debug!("Spurious wake token for {name}");
            }
        }

        Ok(())
    })
}

/// Keep `MAX_READ_TRANSFERS` bulk-in transfers in flight; every completion
/// is validated, handed to the event loop and its buffer re-submitted.
async fn read_pump(
    interface: Interface,
    endpoint_in: u8,
    events: SourceQueue<BrickEvent>,
    notifier: Notifier,
    name: String,
) {
    let mut queue = interface.bulk_in_queue(endpoint_in);

    for _ in 0..MAX_READ_TRANSFERS {
        queue.submit(RequestBuffer::new(tfp::packet::MAX_PACKET_SIZE));
    }

    loop {
        let completion = queue.next_complete().await;

        match completion.status {
            Ok(()) => {
                if let Some(packet) = parse_read_transfer(&completion.data, &name) {
                    events.push(BrickEvent::Response(packet));

                    if !notifier.notify() {
                        return;
                    }
                }

                queue.submit(RequestBuffer::reuse(
                    completion.data,
                    tfp::packet::MAX_PACKET_SIZE,
                ));
            }
            Err(TransferError::Cancelled) => return,
            Err(TransferError::Disconnected) => {
                // hotplug removal tears the Brick down
                debug!("Read transfer for {name} observed a disconnect");
                return;
            }
            Err(error) => {
                warn!("Read transfer for {name} failed: {error}");
                queue.submit(RequestBuffer::new(tfp::packet::MAX_PACKET_SIZE));
            }
        }
    }
}

/// Validation rules for bytes coming out of a Brick: a short transfer, a
/// length mismatch or an invalid response header drops the data with a
/// diagnostic; the transfer is re-submitted either way.
fn parse_read_transfer(data: &[u8], name: &str) -> Option<Packet> {
    if data.len() < HEADER_SIZE {
        error!(
            "Read transfer returned response with incomplete header (actual: {} < minimum: {}) from {}",
            data.len(),
            HEADER_SIZE,
            name
        );
        return None;
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..HEADER_SIZE]);
    let header = Header::from_bytes(&header_bytes);

    if data.len() != header.length as usize {
        error!(
            "Read transfer returned response with length mismatch (actual: {} != expected: {}) from {}",
            data.len(),
            header.length,
            name
        );
        return None;
    }

    if let Err(reason) = header.validate_response() {
        debug!("Got invalid response from {name}: {reason}");
        return None;
    }

    Packet::parse(data).ok()
}

/// Drain the write channel into up to `MAX_WRITE_TRANSFERS` in-flight
/// bulk-out transfers. Every completion frees a slot and pokes the event
/// loop so the Brick's overflow queue can refill the channel.
async fn write_pump(
    interface: Interface,
    endpoint_out: u8,
    mut rx: mpsc::Receiver<Packet>,
    events: SourceQueue<BrickEvent>,
    notifier: Notifier,
    name: String,
) {
    let mut queue = interface.bulk_out_queue(endpoint_out);

    loop {
        while queue.pending() < MAX_WRITE_TRANSFERS {
            match rx.try_recv() {
                Ok(packet) => queue.submit(packet.to_bytes()),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return,
            }
        }

        if queue.pending() == 0 {
            match rx.recv().await {
                Some(packet) => queue.submit(packet.to_bytes()),
                None => return,
            }
        } else {
            let completion = queue.next_complete().await;

            match completion.status {
                Ok(()) => {}
                Err(TransferError::Cancelled) => return,
                Err(TransferError::Disconnected) => return,
                Err(error) => warn!("Write transfer for {name} failed: {error}"),
            }

            events.push(BrickEvent::WriteDone);

            if !notifier.notify() {
                return;
            }
        }
    }
}
