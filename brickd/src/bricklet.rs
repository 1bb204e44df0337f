//! Bricklet port support: builds one SPITFP stack per configured chip
//! select and hands enumerate traffic through the position/connected-uid
//! rewrite before it reaches the router.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use log::{debug, error, info, warn};

use tfp::base58;
use tfp::enumerate::{
    DEVICE_IDENTIFIER_HAT, DEVICE_IDENTIFIER_HAT_ZERO, ISOLATOR_POSITION, NO_CONNECTED_UID,
};
use tfp::packet::function;
use tfp::Packet;

use crate::config::ChipSelectDriver;
use crate::daemon::Daemon;
use crate::hardware::StackId;
use crate::reactor::{Callback, Ops, SourceId, SourceKind, SourceQueue};
use crate::spitfp::hal::{ChipSelect, GpioChipSelect, HardwareChipSelect, SpidevBus};
use crate::spitfp::{SpiLink, SpiLinkConfig};
use crate::stack::{DispatchResult, Recipient, Stack, StackBase};

/// Up to two SPI hardware units can be used in parallel.
pub const MAX_GROUPS: usize = 2;

/// Chip selects (= ports) per group.
pub const MAX_CHIP_SELECTS: usize = 10;

/// The registry-facing side of one Bricklet port.
pub struct BrickletStack {
    base: StackBase,
    request_queue: Arc<Mutex<VecDeque<Packet>>>,
    data_seen: Arc<AtomicBool>,
}

impl BrickletStack {
    pub fn new(
        name: impl Into<String>,
        request_queue: Arc<Mutex<VecDeque<Packet>>>,
        data_seen: Arc<AtomicBool>,
    ) -> Self {
        Self {
            base: StackBase::new(name),
            request_queue,
            data_seen,
        }
    }
}

impl Stack for BrickletStack {
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

        // nothing ever answered on this port, don't queue into the void
        if !self.data_seen.load(Ordering::Relaxed) {
            return DispatchResult::Dropped;
        }

        self.request_queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(*request);

        debug!(
            "Queued request ({}) for {}",
            request.request_signature(),
            self.base.name
        );

        DispatchResult::Accepted
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Handle on a running SPI worker, kept for shutdown.
pub struct SpiPortControl {
    pub name: String,
    pub stack_id: StackId,
    pub source: SourceId,
    running: Arc<AtomicBool>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl SpiPortControl {
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for the worker with a bounded deadline; a wedged SPI ioctl must
    /// not stall shutdown forever.
    pub async fn join(mut self) {
        if let Some(worker) = self.worker.take() {
            if tokio::time::timeout(Duration::from_secs(2), worker)
                .await
                .is_err()
            {
                warn!("SPI worker for {} did not stop in time", self.name);
            }
        }
    }
}

/// Build all configured Bricklet ports. Called once at startup.
pub fn setup_ports(daemon: &mut Daemon, ops: &mut Ops<Daemon>) -> anyhow::Result<()> {
    let config = Arc::clone(&daemon.config);
    let mut port_index = 0usize;

    for group in config.bricklet.group.iter().take(MAX_GROUPS) {
        // ports of one group share the bus, serialized by this lock
        let bus_lock = Arc::new(Mutex::new(()));

        for (cs_index, cs) in group.cs.iter().enumerate().take(MAX_CHIP_SELECTS) {
            let port_letter = (b'a' + cs_index as u8) as char;

            let (spidev_path, chip_select): (String, Box<dyn ChipSelect>) = match cs.driver {
                ChipSelectDriver::Hardware => (
                    group.spidev.replace("%d", &cs.num.to_string()),
                    Box::new(HardwareChipSelect),
                ),
                ChipSelectDriver::Gpio => {
                    if cs.name.is_empty() {
                        warn!(
                            "Bricklet port {port_letter} uses GPIO chip select without a name, ignoring it"
                        );
                        continue;
                    }

                    (
                        group.spidev.replace("%d", "0"),
                        Box::new(GpioChipSelect::open(&cs.name, cs.num as u32).with_context(
                            || format!("chip select setup for port {port_letter} failed"),
                        )?),
                    )
                }
                ChipSelectDriver::Wiringpi => {
                    warn!(
                        "Bricklet port {port_letter} uses the unsupported wiringpi chip select driver, ignoring it"
                    );
                    continue;
                }
            };

            let bus = SpidevBus::open(&spidev_path, cs.driver == ChipSelectDriver::Hardware)
                .with_context(|| format!("SPI setup for port {port_letter} failed"))?;

            let sleep_between_reads = config.bricklet.sleep_between_reads(port_letter);

            info!(
                "Found Bricklet port {port_letter} (spidev: {spidev_path}, driver: {:?}, name: {}, num: {})",
                cs.driver,
                if cs.name.is_empty() { "<unused>" } else { cs.name.as_str() },
                cs.num
            );

            create_port(
                daemon,
                ops,
                PortSetup {
                    name: format!("Bricklet-{spidev_path}-{port_letter}"),
                    port_index,
                    bus: Box::new(bus),
                    chip_select,
                    bus_lock: Arc::clone(&bus_lock),
                    sleep_between_reads: Duration::from_micros(sleep_between_reads as u64),
                    startup_wait: Duration::ZERO,
                },
            );

            port_index += 1;
        }
    }

    if port_index == 0 {
        debug!("Found no bricklet.* section in config file");
    }

    Ok(())
}

pub struct PortSetup {
    pub name: String,
    pub port_index: usize,
    pub bus: Box<dyn crate::spitfp::hal::SpiBus>,
    pub chip_select: Box<dyn ChipSelect>,
    pub bus_lock: Arc<Mutex<()>>,
    pub sleep_between_reads: Duration,
    pub startup_wait: Duration,
}

/// Wire one port into the registry and the event loop and start its SPI
/// worker.
pub fn create_port(daemon: &mut Daemon, ops: &mut Ops<Daemon>, setup: PortSetup) {
    let request_queue: Arc<Mutex<VecDeque<Packet>>> = Arc::new(Mutex::new(VecDeque::new()));
    let responses: SourceQueue<Packet> = SourceQueue::new();
    let data_seen = Arc::new(AtomicBool::new(false));

    let stack = BrickletStack::new(
        setup.name.clone(),
        Arc::clone(&request_queue),
        Arc::clone(&data_seen),
    );
    let stack_id = daemon.registry.add(Box::new(stack));
    daemon.metrics.stack_added();

    let source = ops.add_source(
        setup.name.clone(),
        SourceKind::Generic,
        port_callback(
            stack_id,
            responses.clone(),
            Arc::clone(&daemon.connected_uid),
            Arc::clone(&data_seen),
            setup.port_index,
            setup.name.clone(),
        ),
    );

    let link = SpiLink::new(
        SpiLinkConfig {
            name: setup.name.clone(),
            startup_wait: setup.startup_wait,
            sleep_between_reads: setup.sleep_between_reads,
        },
        setup.bus,
        setup.chip_select,
        setup.bus_lock,
        request_queue,
        responses,
        daemon.handle.notifier(source),
        data_seen,
    );

    let running = Arc::new(AtomicBool::new(true));
    let worker = {
        let running = Arc::clone(&running);
        tokio::task::spawn_blocking(move || link.run(running))
    };

    daemon.spi_ports.push(SpiPortControl {
        name: setup.name,
        stack_id,
        source,
        running,
        worker: Some(worker),
    });
}

fn port_callback(
    stack_id: StackId,
    responses: SourceQueue<Packet>,
    connected_uid: Arc<AtomicU32>,
    data_seen: Arc<AtomicBool>,
    port_index: usize,
    port_name: String,
) -> Callback<Daemon> {
    Box::new(move |daemon, ops| {
        let Some(mut packet) = responses.pop() else {
            // the wake token is a semaphore; an empty queue means the pair
            // desynchronized and the port cannot be trusted anymore
            error!(
                "Response queue and notification event are out-of-sync for {port_name}, stopping the port"
            );

            daemon.registry.mark_for_removal(stack_id);

            if let Some(port) = daemon
                .spi_ports
                .iter()
                .find(|port| port.stack_id == stack_id)
            {
                port.stop();
                ops.remove_source(port.source);
            }

            return Ok(());
        };

        // Co-MCU Bricklets announce themselves with enumerates; that is
        // where this stack's routing entries come from.
        if packet.header.function_id == function::CALLBACK_ENUMERATE {
            if let Some(stack) = daemon.registry.get_mut(stack_id) {
                stack.base_mut().recipients.add_if_missing(packet.header.uid);
            }
        }

        if packet.header.function_id == function::CALLBACK_ENUMERATE
            || packet.header.function_id == function::GET_IDENTITY
        {
            rewrite_identity_fields(&mut packet, &connected_uid, port_index);
        }

        if packet.header.sequence_number() == 0 {
            debug!(
                "Got {} ({}) from {}",
                tfp::enumerate::callback_subtype(&packet)
                    .map(|subtype| subtype.label())
                    .unwrap_or("callback"),
                packet.callback_signature(),
                port_name
            );
        } else {
            debug!(
                "Got response ({}) from {}",
                packet.response_signature(),
                port_name
            );
        }

        data_seen.store(true, Ordering::Relaxed);
        daemon.dispatch_response(Some(stack_id), &packet);

        Ok(())
    })
}

/// Byte offsets of the identity fields shared by the enumerate callback
/// (34 bytes) and the get-identity response (33 bytes).
const CONNECTED_UID_RANGE: std::ops::Range<usize> = 8..16;
const POSITION_OFFSET: usize = 16;
const DEVICE_IDENTIFIER_OFFSET: usize = 23;
const IDENTITY_PAYLOAD_MIN: usize = 25;

/// A directly attached Bricklet reports position '0' and no parent; patch
/// in the daemon-side port letter and the HAT UID (once one is known). A
/// report relayed by an isolator is already complete and passes through.
fn rewrite_identity_fields(packet: &mut Packet, connected_uid: &AtomicU32, port_index: usize) {
    let uid = packet.header.uid;
    let payload = packet.payload_mut();

    if payload.len() < IDENTITY_PAYLOAD_MIN {
        return;
    }

    let device_identifier = u16::from_le_bytes([
        payload[DEVICE_IDENTIFIER_OFFSET],
        payload[DEVICE_IDENTIFIER_OFFSET + 1],
    ]);

    if device_identifier == DEVICE_IDENTIFIER_HAT
        || device_identifier == DEVICE_IDENTIFIER_HAT_ZERO
    {
        connected_uid.store(uid, Ordering::Relaxed);
    }

    if payload[POSITION_OFFSET] != ISOLATOR_POSITION || payload[CONNECTED_UID_RANGE.start] == 0 {
        payload[CONNECTED_UID_RANGE].fill(0);
        payload[CONNECTED_UID_RANGE.start..CONNECTED_UID_RANGE.start + NO_CONNECTED_UID.len()]
            .copy_from_slice(NO_CONNECTED_UID.as_bytes());

        let hat_uid = connected_uid.load(Ordering::Relaxed);

        if hat_uid != 0
            && device_identifier != DEVICE_IDENTIFIER_HAT
            && device_identifier != DEVICE_IDENTIFIER_HAT_ZERO
        {
            let encoded = base58::encode(hat_uid);
            payload[CONNECTED_UID_RANGE].fill(0);
            payload[CONNECTED_UID_RANGE.start..CONNECTED_UID_RANGE.start + encoded.len()]
                .copy_from_slice(encoded.as_bytes());
        }

        payload[POSITION_OFFSET] = b'a' + port_index as u8;
    }
}
