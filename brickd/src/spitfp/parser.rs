//! Parser for the SPITFP receive ring buffer.
//!
//! Bytes are only removed from the ring once a complete frame passed its
//! checksum; a partial frame stays put until the missing bytes arrive. Any
//! framing or checksum error drains the ring, the link layer recovers via
//! retransmission.

use crate::ring::Ringbuffer;
use crate::spitfp::frame::{
    pearson_step, ACK_FRAME_LENGTH, MAX_DATA_FRAME_LENGTH, MIN_DATA_FRAME_LENGTH,
    PROTOCOL_OVERHEAD,
};

/// Per-link error counters, diagnostic only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCounters {
    pub ack_checksum: u32,
    pub message_checksum: u32,
    pub message_packet: u32,
    pub frame: u32,
    pub overflow: u32,
}

/// A frame accepted by the parser.
#[derive(Debug, PartialEq, Eq)]
pub enum ParsedFrame {
    Ack {
        last_seen_by_peer: u8,
    },
    Message {
        payload: Vec<u8>,
        sequence_byte: u8,
    },
}

#[derive(Debug, Clone, Copy)]
enum State {
    Start,
    AckSequenceNumber,
    AckChecksum,
    MessageSequenceNumber,
    MessageData,
    MessageChecksum,
}

/// How many bytes are still missing for the frame at the front of the
/// ring. Leading garbage length bytes are consumed here (counting frame
/// errors), zeros silently. Used to size the next SPI transaction.
pub fn missing_length(ring: &mut Ringbuffer, counters: &mut ErrorCounters) -> usize {
    while let Some(length) = ring.peek(0) {
        let length = length as usize;

        let plausible = length == ACK_FRAME_LENGTH
            || (MIN_DATA_FRAME_LENGTH..=MAX_DATA_FRAME_LENGTH).contains(&length);

        if !plausible {
            if length != 0 {
                counters.frame += 1;
            }

            ring.remove(1);
            continue;
        }

        return length.saturating_sub(ring.used());
    }

    0
}

/// Try to parse one frame from the ring. `None` means "no complete valid
/// frame right now" -- either more bytes are needed (ring untouched past
/// leading zeros) or an error drained the ring.
pub fn parse_frame(ring: &mut Ringbuffer, counters: &mut ErrorCounters) -> Option<ParsedFrame> {
    let mut state = State::Start;
    let mut checksum: u8 = 0;
    let mut consumed = 0usize;
    let mut data_length = 0usize;
    let mut sequence_byte = 0u8;
    let mut payload = Vec::new();

    let used = ring.used();
    let mut index = 0usize;

    while index < used {
        let byte = match ring.peek(consumed) {
            Some(byte) => byte,
            None => return None,
        };
        index += 1;

        // standard case: the peer clocks out zeros while it has nothing to
        // say; drop them without entering the state machine
        if matches!(state, State::Start) && byte == 0 {
            ring.remove(1);
            continue;
        }

        consumed += 1;

        match state {
            State::Start => {
                checksum = 0;
                payload.clear();
                data_length = byte as usize;

                if data_length == PROTOCOL_OVERHEAD {
                    state = State::AckSequenceNumber;
                } else if (MIN_DATA_FRAME_LENGTH..=MAX_DATA_FRAME_LENGTH).contains(&data_length) {
                    state = State::MessageSequenceNumber;
                } else {
                    counters.frame += 1;
                    ring.clear();
                    log::debug!("SPITFP frame error (count: {})", counters.frame);
                    return None;
                }

                if used - (index - 1) < data_length {
                    // not enough bytes for a whole frame yet
                    return None;
                }

                checksum = pearson_step(checksum, byte);
            }

            State::AckSequenceNumber => {
                sequence_byte = byte;
                checksum = pearson_step(checksum, byte);
                state = State::AckChecksum;
            }

            State::AckChecksum => {
                ring.remove(consumed);

                if checksum != byte {
                    counters.ack_checksum += 1;
                    ring.clear();
                    log::debug!("SPITFP ACK checksum error (count: {})", counters.ack_checksum);
                    return None;
                }

                return Some(ParsedFrame::Ack {
                    last_seen_by_peer: (sequence_byte & 0xf0) >> 4,
                });
            }

            State::MessageSequenceNumber => {
                sequence_byte = byte;
                checksum = pearson_step(checksum, byte);
                state = State::MessageData;
            }

            State::MessageData => {
                payload.push(byte);
                checksum = pearson_step(checksum, byte);

                if payload.len() == data_length - PROTOCOL_OVERHEAD {
                    state = State::MessageChecksum;
                }
            }

            State::MessageChecksum => {
                ring.remove(consumed);

                if checksum != byte {
                    counters.message_checksum += 1;
                    ring.clear();
                    log::debug!(
                        "SPITFP message checksum error (count: {})",
                        counters.message_checksum
                    );
                    return None;
                }

                return Some(ParsedFrame::Message {
                    payload: std::mem::take(&mut payload),
                    sequence_byte,
                });
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spitfp::frame::{pearson, sequence_byte};

    fn ring_with(bytes: &[u8]) -> Ringbuffer {
        let mut ring = Ringbuffer::new(1024);
        for &byte in bytes {
            assert!(ring.add(byte));
        }
        ring
    }

    fn data_frame(payload: &[u8], seq: u8, last_seen: u8) -> Vec<u8> {
        let mut frame = vec![(payload.len() + PROTOCOL_OVERHEAD) as u8];
        frame.push(sequence_byte(seq, last_seen));
        frame.extend_from_slice(payload);
        frame.push(pearson(&frame));
        frame
    }

    fn ack_frame(last_seen: u8) -> Vec<u8> {
        let mut frame = vec![3u8, last_seen << 4];
        frame.push(pearson(&frame));
        frame
    }

    #[test]
    fn parses_ack() {
        let mut counters = ErrorCounters::default();
        let mut ring = ring_with(&ack_frame(5));

        assert_eq!(
            parse_frame(&mut ring, &mut counters),
            Some(ParsedFrame::Ack {
                last_seen_by_peer: 5
            })
        );
        assert!(ring.is_empty());
        assert_eq!(counters, ErrorCounters::default());
    }

    #[test]
    fn parses_message_and_skips_leading_zeros() {
        let mut counters = ErrorCounters::default();
        let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut bytes = vec![0u8, 0, 0];
        bytes.extend(data_frame(&payload, 5, 2));
        let mut ring = ring_with(&bytes);

        assert_eq!(
            parse_frame(&mut ring, &mut counters),
            Some(ParsedFrame::Message {
                payload: payload.to_vec(),
                sequence_byte: sequence_byte(5, 2),
            })
        );
        assert!(ring.is_empty());
    }

    #[test]
    fn incomplete_frame_stays_in_the_ring() {
        let mut counters = ErrorCounters::default();
        let frame = data_frame(&[1, 2, 3, 4, 5, 6, 7, 8], 5, 0);
        let mut ring = ring_with(&frame[..6]);

        assert_eq!(parse_frame(&mut ring, &mut counters), None);
        assert_eq!(ring.used(), 6);

        for &byte in &frame[6..] {
            ring.add(byte);
        }

        assert!(matches!(
            parse_frame(&mut ring, &mut counters),
            Some(ParsedFrame::Message { .. })
        ));
    }

    #[test]
    fn checksum_error_drains_the_ring() {
        let mut counters = ErrorCounters::default();
        let mut frame = data_frame(&[0xaa, 0xbb, 1, 2, 3, 4, 5, 6], 2, 1);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        frame.extend_from_slice(&[0, 0, 0x55]); // trailing junk must go too
        let mut ring = ring_with(&frame);

        assert_eq!(parse_frame(&mut ring, &mut counters), None);
        assert_eq!(counters.message_checksum, 1);
        assert!(ring.is_empty());
    }

    #[test]
    fn bad_length_byte_counts_frame_error_and_drains() {
        let mut counters = ErrorCounters::default();
        let mut ring = ring_with(&[9u8, 1, 2, 3]); // 9 is no valid frame length

        assert_eq!(parse_frame(&mut ring, &mut counters), None);
        assert_eq!(counters.frame, 1);
        assert!(ring.is_empty());
    }

    #[test]
    fn ack_checksum_error_counts_and_drains() {
        let mut counters = ErrorCounters::default();
        let mut frame = ack_frame(5);
        frame[2] ^= 0x01;
        let mut ring = ring_with(&frame);

        assert_eq!(parse_frame(&mut ring, &mut counters), None);
        assert_eq!(counters.ack_checksum, 1);
        assert!(ring.is_empty());
    }

    #[test]
    fn missing_length_reports_remainder() {
        let mut counters = ErrorCounters::default();
        let frame = data_frame(&[1, 2, 3, 4, 5, 6, 7, 8], 3, 0);
        let mut ring = ring_with(&frame[..4]);

        assert_eq!(missing_length(&mut ring, &mut counters), frame.len() - 4);

        // garbage length byte first: consumed with a frame error
        let mut ring = ring_with(&[200u8, 3, 0x10]);
        assert_eq!(missing_length(&mut ring, &mut counters), 1);
        assert_eq!(counters.frame, 1);

        // zeros are consumed silently
        let mut ring = ring_with(&[0u8, 0, 0]);
        assert_eq!(missing_length(&mut ring, &mut counters), 0);
        assert_eq!(counters.frame, 1);
        assert!(ring.is_empty());
    }
}
