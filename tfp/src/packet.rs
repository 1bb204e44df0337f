use std::fmt;

use thiserror::Error;

use crate::base58;

/// Size of the fixed TFP header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Largest valid TFP frame (header plus payload).
pub const MAX_PACKET_SIZE: usize = 80;

/// Largest payload a frame can carry.
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// UID that addresses the daemon itself.
pub const UID_BRICK_DAEMON: u32 = 1;

/// Well-known function IDs the daemon has to recognize.
pub mod function {
    pub const GET_AUTHENTICATION_NONCE: u8 = 1;
    pub const AUTHENTICATE: u8 = 2;
    pub const DISCONNECT_PROBE: u8 = 128;
    pub const STACK_ENUMERATE: u8 = 252;
    pub const CALLBACK_ENUMERATE: u8 = 253;
    pub const GET_IDENTITY: u8 = 255;
}

/// Error code carried in bits 7..6 of the last header byte of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    InvalidParameter = 1,
    FunctionNotSupported = 2,
    Unknown = 3,
}

impl ErrorCode {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => ErrorCode::Ok,
            1 => ErrorCode::InvalidParameter,
            2 => ErrorCode::FunctionNotSupported,
            _ => ErrorCode::Unknown,
        }
    }
}

/// Reason a header failed request or response validation.
///
/// The variants mirror the checks in the order they are applied, so the
/// first failing check determines the reported reason.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("length is too small")]
    LengthTooSmall,
    #[error("length is too big")]
    LengthTooBig,
    #[error("invalid UID")]
    InvalidUid,
    #[error("invalid function ID")]
    InvalidFunctionId,
    #[error("invalid sequence number")]
    InvalidSequenceNumber,
    #[error("invalid response expected bit")]
    InvalidResponseExpected,
    #[error("truncated packet")]
    Truncated,
}

/// The fixed TFP header. All multi-byte fields are little-endian on the
/// wire; `uid` is converted once at the codec boundary and handled as a
/// plain `u32` everywhere else (recipient tables included).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub uid: u32,
    pub length: u8,
    pub function_id: u8,
    pub sequence_number_and_options: u8,
    pub error_code_and_future_use: u8,
}

impl Header {
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            uid: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            length: bytes[4],
            function_id: bytes[5],
            sequence_number_and_options: bytes[6],
            error_code_and_future_use: bytes[7],
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let uid = self.uid.to_le_bytes();
        [
            uid[0],
            uid[1],
            uid[2],
            uid[3],
            self.length,
            self.function_id,
            self.sequence_number_and_options,
            self.error_code_and_future_use,
        ]
    }

    pub fn sequence_number(&self) -> u8 {
        (self.sequence_number_and_options >> 4) & 0x0f
    }

    pub fn set_sequence_number(&mut self, sequence_number: u8) {
        self.sequence_number_and_options =
            (self.sequence_number_and_options & 0x0f) | ((sequence_number << 4) & 0xf0);
    }

    pub fn response_expected(&self) -> bool {
        (self.sequence_number_and_options >> 3) & 0x01 == 1
    }

    pub fn set_response_expected(&mut self, response_expected: bool) {
        if response_expected {
            self.sequence_number_and_options |= 1 << 3;
        } else {
            self.sequence_number_and_options &= !(1 << 3);
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_bits(self.error_code_and_future_use >> 6)
    }

    pub fn set_error_code(&mut self, error_code: ErrorCode) {
        self.error_code_and_future_use =
            (self.error_code_and_future_use & 0x3f) | ((error_code as u8) << 6);
    }

    /// Validate this header as a request coming from an API client.
    pub fn validate_request(&self) -> Result<(), PacketError> {
        if (self.length as usize) < HEADER_SIZE {
            return Err(PacketError::LengthTooSmall);
        }

        if (self.length as usize) > MAX_PACKET_SIZE {
            return Err(PacketError::LengthTooBig);
        }

        if self.function_id == 0 {
            return Err(PacketError::InvalidFunctionId);
        }

        if self.sequence_number() == 0 {
            return Err(PacketError::InvalidSequenceNumber);
        }

        Ok(())
    }

    /// Validate this header as a response coming from a device.
    pub fn validate_response(&self) -> Result<(), PacketError> {
        if (self.length as usize) < HEADER_SIZE {
            return Err(PacketError::LengthTooSmall);
        }

        if (self.length as usize) > MAX_PACKET_SIZE {
            return Err(PacketError::LengthTooBig);
        }

        if self.uid == 0 {
            return Err(PacketError::InvalidUid);
        }

        if self.function_id == 0 {
            return Err(PacketError::InvalidFunctionId);
        }

        if !self.response_expected() {
            return Err(PacketError::InvalidResponseExpected);
        }

        Ok(())
    }
}

/// A complete TFP frame. Packets are small fixed-size values and are copied
/// freely between queues, like the C `Packet` struct they descend from.
#[derive(Clone, Copy)]
pub struct Packet {
    pub header: Header,
    payload: [u8; MAX_PAYLOAD_SIZE],
}

impl Packet {
    /// Build a packet from a header and payload. The header length field is
    /// set from the payload length.
    pub fn new(mut header: Header, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);

        header.length = (HEADER_SIZE + payload.len()) as u8;

        let mut buffer = [0u8; MAX_PAYLOAD_SIZE];
        buffer[..payload.len()].copy_from_slice(payload);

        Self {
            header,
            payload: buffer,
        }
    }

    /// Header-only packet, used for requests and error responses without
    /// payload.
    pub fn from_header(mut header: Header) -> Self {
        header.length = HEADER_SIZE as u8;

        Self {
            header,
            payload: [0u8; MAX_PAYLOAD_SIZE],
        }
    }

    /// Parse a complete frame. The slice must hold exactly the number of
    /// bytes announced in the header and the length must be in bounds.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_SIZE {
            return Err(PacketError::Truncated);
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&bytes[..HEADER_SIZE]);
        let header = Header::from_bytes(&header_bytes);

        if (header.length as usize) < HEADER_SIZE {
            return Err(PacketError::LengthTooSmall);
        }

        if (header.length as usize) > MAX_PACKET_SIZE {
            return Err(PacketError::LengthTooBig);
        }

        if bytes.len() != header.length as usize {
            return Err(PacketError::Truncated);
        }

        let mut payload = [0u8; MAX_PAYLOAD_SIZE];
        payload[..bytes.len() - HEADER_SIZE].copy_from_slice(&bytes[HEADER_SIZE..]);

        Ok(Self { header, payload })
    }

    pub fn len(&self) -> usize {
        self.header.length as usize
    }

    pub fn is_empty(&self) -> bool {
        false // a packet always carries at least its header
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.len() - HEADER_SIZE]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let length = self.len();
        &mut self.payload[..length - HEADER_SIZE]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(self.payload());
        bytes
    }

    /// A response matches a pending request iff UID, function ID and
    /// sequence number agree.
    pub fn matches_pending(&self, pending: &Header) -> bool {
        self.header.uid == pending.uid
            && self.header.function_id == pending.function_id
            && self.header.sequence_number() == pending.sequence_number()
    }

    /// Diagnostic one-liner for a request, e.g. `U: abc, L: 8, F: 7, S: 1, R: 1`.
    pub fn request_signature(&self) -> String {
        format!(
            "U: {}, L: {}, F: {}, S: {}, R: {}",
            base58::encode(self.header.uid),
            self.header.length,
            self.header.function_id,
            self.header.sequence_number(),
            self.header.response_expected() as u8
        )
    }

    /// Diagnostic one-liner for a response.
    pub fn response_signature(&self) -> String {
        format!(
            "U: {}, L: {}, F: {}, S: {}, E: {}",
            base58::encode(self.header.uid),
            self.header.length,
            self.header.function_id,
            self.header.sequence_number(),
            self.header.error_code() as u8
        )
    }

    /// Diagnostic one-liner for a callback (no sequence number).
    pub fn callback_signature(&self) -> String {
        format!(
            "U: {}, L: {}, F: {}",
            base58::encode(self.header.uid),
            self.header.length,
            self.header.function_id
        )
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("header", &self.header)
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.payload() == other.payload()
    }
}

impl Eq for Packet {}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_header() -> Header {
        Header {
            uid: 0x0102_0304,
            length: 8,
            function_id: 7,
            sequence_number_and_options: 0x18, // seq 1, response expected
            error_code_and_future_use: 0,
        }
    }

    #[test]
    fn header_roundtrip_is_identity() {
        for seq in 0..16u8 {
            for response_expected in [false, true] {
                let mut header = request_header();
                header.set_sequence_number(seq);
                header.set_response_expected(response_expected);
                header.set_error_code(ErrorCode::FunctionNotSupported);

                let parsed = Header::from_bytes(&header.to_bytes());
                assert_eq!(parsed, header);
                assert_eq!(parsed.sequence_number(), seq);
                assert_eq!(parsed.response_expected(), response_expected);
                assert_eq!(parsed.error_code(), ErrorCode::FunctionNotSupported);
            }
        }
    }

    #[test]
    fn uid_is_little_endian_on_wire() {
        let header = request_header();
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..4], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn validate_request_rejects_bad_headers() {
        let mut header = request_header();
        header.length = 7;
        assert_eq!(header.validate_request(), Err(PacketError::LengthTooSmall));

        let mut header = request_header();
        header.length = 81;
        assert_eq!(header.validate_request(), Err(PacketError::LengthTooBig));

        let mut header = request_header();
        header.function_id = 0;
        assert_eq!(
            header.validate_request(),
            Err(PacketError::InvalidFunctionId)
        );

        let mut header = request_header();
        header.set_sequence_number(0);
        assert_eq!(
            header.validate_request(),
            Err(PacketError::InvalidSequenceNumber)
        );

        assert_eq!(request_header().validate_request(), Ok(()));
    }

    #[test]
    fn validate_response_requires_uid_and_response_expected() {
        let mut header = request_header();
        header.uid = 0;
        assert_eq!(header.validate_response(), Err(PacketError::InvalidUid));

        let mut header = request_header();
        header.set_response_expected(false);
        assert_eq!(
            header.validate_response(),
            Err(PacketError::InvalidResponseExpected)
        );

        assert_eq!(request_header().validate_response(), Ok(()));
    }

    #[test]
    fn packet_roundtrip_with_payload() {
        let payload = [0xaa, 0xbb, 0xcc, 0xdd];
        let packet = Packet::new(request_header(), &payload);

        assert_eq!(packet.len(), 12);
        assert_eq!(packet.payload(), &payload);

        let bytes = packet.to_bytes();
        let parsed = Packet::parse(&bytes).unwrap();
        assert_eq!(parsed.header, packet.header);
        assert_eq!(parsed.payload(), packet.payload());
    }

    #[test]
    fn parse_rejects_length_mismatch() {
        let packet = Packet::new(request_header(), &[1, 2, 3]);
        let mut bytes = packet.to_bytes();
        bytes.push(0);
        assert_eq!(Packet::parse(&bytes), Err(PacketError::Truncated));
    }

    #[test]
    fn matches_pending_needs_all_three_fields() {
        let packet = Packet::from_header(request_header());
        let mut pending = request_header();
        assert!(packet.matches_pending(&pending));

        pending.uid = 42;
        assert!(!packet.matches_pending(&pending));

        pending = request_header();
        pending.function_id = 8;
        assert!(!packet.matches_pending(&pending));

        pending = request_header();
        pending.set_sequence_number(2);
        assert!(!packet.matches_pending(&pending));
    }

    #[test]
    fn request_signature_is_stable() {
        let packet = Packet::from_header(request_header());
        assert_eq!(
            packet.request_signature(),
            format!("U: {}, L: 8, F: 7, S: 1, R: 1", base58::encode(0x0102_0304))
        );
    }
}
