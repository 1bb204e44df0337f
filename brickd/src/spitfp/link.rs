//! The SPITFP link state machine and polling loop.
//!
//! One worker runs per Bricklet port on a blocking task. The master polls
//! continuously because the slave cannot signal readiness: every cycle
//! clocks out at most one pending frame (or a probe byte) and feeds
//! whatever came back into the receive ring. Frames carry 4-bit sequence
//! numbers in both directions; a data frame stays in the send buffer until
//! the peer acknowledged it, with a 5 ms retransmit timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error};

use tfp::packet::function;
use tfp::{Header, Packet};

use crate::reactor::{Notifier, SourceQueue};
use crate::ring::Ringbuffer;
use crate::spitfp::frame::{self, SendBuffer, ACK_FRAME_LENGTH, MAX_DATA_FRAME_LENGTH};
use crate::spitfp::hal::{ChipSelect, SpiBus};
use crate::spitfp::parser::{self, ErrorCounters, ParsedFrame};

/// Polls before the bootstrap enumerate is abandoned and the link drops to
/// slow polling.
pub const FIRST_MESSAGE_TRIES: u32 = 1000;

/// A data frame unacknowledged for this long is retransmitted.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(5);

pub const RECEIVE_BUFFER_LENGTH: usize = 1024;

pub struct SpiLinkConfig {
    pub name: String,
    pub startup_wait: Duration,
    pub sleep_between_reads: Duration,
}

pub struct SpiLink {
    config: SpiLinkConfig,
    bus: Box<dyn SpiBus>,
    chip_select: Box<dyn ChipSelect>,
    /// One lock per SPI bus; several ports share a bus via GPIO chip
    /// select.
    bus_lock: Arc<Mutex<()>>,
    request_queue: Arc<Mutex<VecDeque<Packet>>>,
    responses: SourceQueue<Packet>,
    notifier: Notifier,
    data_seen: Arc<AtomicBool>,

    ring: Ringbuffer,
    send_buffer: SendBuffer,
    tmp_response: Option<Packet>,
    current_sequence_number: u8,
    last_sequence_number_seen: u8,
    last_send_started: Instant,
    wait_for_ack: bool,
    ack_to_send: bool,
    first_message_tries: u32,
    counters: ErrorCounters,
}

impl SpiLink {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SpiLinkConfig,
        bus: Box<dyn SpiBus>,
        chip_select: Box<dyn ChipSelect>,
        bus_lock: Arc<Mutex<()>>,
        request_queue: Arc<Mutex<VecDeque<Packet>>>,
        responses: SourceQueue<Packet>,
        notifier: Notifier,
        data_seen: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            bus,
            chip_select,
            bus_lock,
            request_queue,
            responses,
            notifier,
            data_seen,
            ring: Ringbuffer::new(RECEIVE_BUFFER_LENGTH),
            send_buffer: SendBuffer::default(),
            tmp_response: None,
            current_sequence_number: 0,
            last_sequence_number_seen: 0,
            last_send_started: Instant::now(),
            wait_for_ack: false,
            ack_to_send: false,
            first_message_tries: 0,
            counters: ErrorCounters::default(),
        }
    }

    pub fn counters(&self) -> ErrorCounters {
        self.counters
    }

    /// Worker entry point: bootstrap, then poll until told to stop.
    pub fn run(mut self, running: Arc<AtomicBool>) {
        std::thread::sleep(self.config.startup_wait);

        // Pre-load a stack-enumerate request. After a daemon restart the
        // co-processor does not know it has to announce itself again, so
        // the master asks. Sequence number 0 with the response-expected
        // bit matches what the co-processors expect for this bootstrap.
        let header = Header {
            uid: 0,
            length: tfp::packet::HEADER_SIZE as u8,
            function_id: function::STACK_ENUMERATE,
            sequence_number_and_options: 0x08,
            error_code_and_future_use: 0,
        };
        self.load_data_frame(&Packet::from_header(header).to_bytes());

        while running.load(Ordering::SeqCst) {
            self.transceive_once();
            self.process_frames();
        }

        debug!("SPI worker for {} stopped", self.config.name);
    }

    fn sequence_byte(&mut self, increase: bool) -> u8 {
        if increase {
            self.current_sequence_number += 1;

            // 1 is reserved for the first frame after reset
            if self.current_sequence_number > 0x0f {
                self.current_sequence_number = 2;
            }
        }

        frame::sequence_byte(self.current_sequence_number, self.last_sequence_number_seen)
    }

    fn load_data_frame(&mut self, payload: &[u8]) {
        let sequence_byte = self.sequence_byte(true);
        self.send_buffer.set_data_frame(payload, sequence_byte);
        self.ack_to_send = false;
        self.last_send_started = Instant::now();
    }

    fn check_request_queue(&mut self) {
        if !self.send_buffer.is_empty() {
            return;
        }

        let request = self
            .request_queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();

        if let Some(request) = request {
            debug!(
                "Sending request ({}) over SPI ({})",
                request.request_signature(),
                self.config.name
            );
            self.load_data_frame(&request.to_bytes());
        }
    }

    fn send_ack(&mut self) {
        // a fresh data frame carries the latest last-seen number and acks
        // implicitly
        self.check_request_queue();

        if !self.send_buffer.is_empty() {
            return;
        }

        self.send_buffer.set_ack_frame(self.last_sequence_number_seen);
        self.ack_to_send = false;
        self.last_send_started = Instant::now();
    }

    fn ack_or_defer(&mut self) {
        if self.send_buffer.is_empty() {
            self.send_ack();
        } else {
            // the pending frame will carry the ack on its next (re)send
            self.ack_to_send = true;
        }
    }

    fn check_send_timeout(&mut self) {
        if self.send_buffer.is_data_frame()
            && (self.last_send_started.elapsed() >= ACK_TIMEOUT || self.ack_to_send)
        {
            // no new sequence number, but the peer's last-seen may have
            // moved and then the checksum has to move with it
            let sequence_byte = self.sequence_byte(false);
            self.send_buffer.update_sequence_byte(sequence_byte);

            self.wait_for_ack = false;
            self.ack_to_send = false;
            self.last_send_started = Instant::now();
        }
    }

    fn queue_response(&mut self, packet: Packet) -> bool {
        self.responses.push(packet);
        self.notifier.notify()
    }

    fn process_message(&mut self, payload: Vec<u8>, sequence_byte: u8) {
        let seen_by_peer = frame::last_seen_by_peer(sequence_byte);

        if seen_by_peer == self.current_sequence_number {
            self.send_buffer.clear();
            self.wait_for_ack = false;
        }

        if self.tmp_response.is_some() {
            // still holding an unhandled message; drop this one, the peer
            // will send it again
            return;
        }

        let message_sequence = frame::message_sequence(sequence_byte);

        // Sequence 1 is only used for the very first message and is always
        // answered, even without traffic in between. Otherwise a peer reset
        // while the link is idle could never get through.
        if message_sequence != self.last_sequence_number_seen || message_sequence == 1 {
            self.last_sequence_number_seen = message_sequence;

            match Packet::parse(&payload).and_then(|packet| {
                packet.header.validate_response().map(|_| packet)
            }) {
                Ok(packet) => {
                    if self.queue_response(packet) {
                        self.ack_or_defer();
                    } else {
                        self.tmp_response = Some(packet);
                    }
                }
                Err(reason) => {
                    // link-layer frame was fine, TFP payload is not: ack
                    // and drop
                    self.counters.message_packet += 1;
                    debug!(
                        "Dropping invalid packet from {}: {} (count: {})",
                        self.config.name, reason, self.counters.message_packet
                    );
                    self.ack_or_defer();
                }
            }
        } else {
            // duplicate, ack again
            self.ack_or_defer();
        }
    }

    /// Parse and handle at most one received frame, then service timeouts.
    fn process_frames(&mut self) {
        if let Some(parked) = self.tmp_response.take() {
            if self.queue_response(parked) {
                self.ack_or_defer();
            } else {
                self.tmp_response = Some(parked);
            }
        }

        self.check_send_timeout();

        match parser::parse_frame(&mut self.ring, &mut self.counters) {
            Some(ParsedFrame::Ack { last_seen_by_peer }) => {
                if last_seen_by_peer == self.current_sequence_number {
                    self.send_buffer.clear();
                    self.wait_for_ack = false;
                }
                // a stale ack is ignored; the pending frame retransmits on
                // timeout
            }
            Some(ParsedFrame::Message {
                payload,
                sequence_byte,
            }) => self.process_message(payload, sequence_byte),
            None => {}
        }
    }

    /// One SPI transaction: decide how many bytes to clock, sleep if there
    /// is nothing to do, exchange bytes under the bus lock and feed the
    /// ring buffer.
    fn transceive_once(&mut self) {
        if !self.data_seen.load(Ordering::Relaxed) {
            if self.first_message_tries < FIRST_MESSAGE_TRIES {
                self.first_message_tries += 1;
            } else {
                // no Bricklet answered; stop pushing the bootstrap frame
                self.send_buffer.clear();
            }
        }

        let length_read = parser::missing_length(&mut self.ring, &mut self.counters);

        if self.send_buffer.is_empty() {
            self.check_request_queue();

            if self.send_buffer.is_empty() && self.ack_to_send {
                self.send_ack();
            }
        }

        let length_write = if self.wait_for_ack {
            0
        } else {
            self.send_buffer.len()
        };
        let length = length_read.max(length_write).max(1);

        if length == 1 || !self.data_seen.load(Ordering::Relaxed) {
            // Nothing to read or write: give the Bricklet breathing room.
            // Before the first data 1 ms per bootstrap try, 500 ms once the
            // bootstrap was abandoned; a hotplugged Bricklet flips
            // data_seen and polling speeds up again.
            let mut sleep = Duration::ZERO;

            if !self.data_seen.load(Ordering::Relaxed) {
                sleep = if self.first_message_tries < FIRST_MESSAGE_TRIES {
                    Duration::from_millis(1)
                } else {
                    Duration::from_millis(500)
                };
            }

            sleep = sleep.max(self.config.sleep_between_reads);

            if !sleep.is_zero() {
                std::thread::sleep(sleep);
            }
        }

        let mut tx = [0u8; MAX_DATA_FRAME_LENGTH];
        let mut rx = [0u8; MAX_DATA_FRAME_LENGTH];
        tx[..length_write].copy_from_slice(&self.send_buffer.bytes()[..length_write]);

        let mut followup: Option<(usize, [u8; MAX_DATA_FRAME_LENGTH])> = None;
        let mut probed_byte: Option<u8> = None;

        let transfer_result = {
            let _bus = self
                .bus_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            if let Err(error) = self.chip_select.select(true) {
                error!("Could not enable chip select ({}): {error:#}", self.config.name);
                return;
            }

            let mut result = self.bus.transceive(&tx[..length], &mut rx[..length]);

            // probe saw a length byte: clock the rest of the frame in the
            // same bus tenure, a stale slave response must not sneak in
            if result.is_ok() && length == 1 && rx[0] != 0 && length_write == 0 {
                probed_byte = Some(rx[0]);

                if !self.ring.add(rx[0]) {
                    self.counters.overflow += 1;
                }

                let missing = parser::missing_length(&mut self.ring, &mut self.counters);

                if missing > 0 {
                    let tx2 = [0u8; MAX_DATA_FRAME_LENGTH];
                    let mut rx2 = [0u8; MAX_DATA_FRAME_LENGTH];
                    result = self.bus.transceive(&tx2[..missing], &mut rx2[..missing]);

                    if result.is_ok() {
                        followup = Some((missing, rx2));
                    }
                }
            }

            if let Err(error) = self.chip_select.select(false) {
                error!("Could not disable chip select ({}): {error:#}", self.config.name);
            }

            result
        };

        if let Err(error) = transfer_result {
            error!("SPI transceive failed ({}): {error:#}", self.config.name);
            return;
        }

        // an ACK is not acked back, clear it right after clocking it out
        if self.send_buffer.len() == ACK_FRAME_LENGTH {
            self.send_buffer.clear();
        }

        if self.send_buffer.is_data_frame() {
            self.wait_for_ack = true;
        }

        match (probed_byte, followup) {
            (Some(_), Some((missing, rx2))) => {
                for &byte in &rx2[..missing] {
                    if !self.ring.add(byte) {
                        self.counters.overflow += 1;
                    }
                }
            }
            (Some(_), None) => {}
            _ => {
                for &byte in &rx[..length] {
                    if !self.ring.add(byte) {
                        self.counters.overflow += 1;
                    }
                }
            }
        }
    }
}
