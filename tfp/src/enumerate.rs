//! The enumerate callback (function 253), a fixed 34-byte frame announcing a
//! device's presence, connection or disconnection.

use crate::base58;
use crate::packet::{function, Header, Packet, HEADER_SIZE};

/// Total size of an enumerate callback frame.
pub const ENUMERATE_CALLBACK_SIZE: usize = 34;

/// Payload size of an enumerate callback.
pub const ENUMERATE_PAYLOAD_SIZE: usize = ENUMERATE_CALLBACK_SIZE - HEADER_SIZE;

/// Placeholder written into `connected_uid` when a device hangs directly off
/// the daemon and has no parent to report.
pub const NO_CONNECTED_UID: &str = "0";

/// Position reported by an isolator relaying a remote device.
pub const ISOLATOR_POSITION: u8 = b'Z';

/// Device identifiers whose enumerates update the connected-uid register.
pub const DEVICE_IDENTIFIER_HAT: u16 = 111;
pub const DEVICE_IDENTIFIER_HAT_ZERO: u16 = 112;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumerationType {
    Available,
    Connected,
    Disconnected,
    Unknown(u8),
}

impl EnumerationType {
    pub fn from_wire(value: u8) -> Self {
        match value {
            0 => EnumerationType::Available,
            1 => EnumerationType::Connected,
            2 => EnumerationType::Disconnected,
            other => EnumerationType::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            EnumerationType::Available => 0,
            EnumerationType::Connected => 1,
            EnumerationType::Disconnected => 2,
            EnumerationType::Unknown(other) => other,
        }
    }

    /// Label used in packet log lines, e.g. `enumerate-connected`.
    pub fn label(self) -> &'static str {
        match self {
            EnumerationType::Available => "enumerate-available",
            EnumerationType::Connected => "enumerate-connected",
            EnumerationType::Disconnected => "enumerate-disconnected",
            EnumerationType::Unknown(_) => "enumerate-<unknown>",
        }
    }
}

/// Parsed view of an enumerate callback payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumerateCallback {
    pub uid: [u8; 8],
    pub connected_uid: [u8; 8],
    pub position: u8,
    pub hardware_version: [u8; 3],
    pub firmware_version: [u8; 3],
    pub device_identifier: u16,
    pub enumeration_type: EnumerationType,
}

impl EnumerateCallback {
    /// Parse the payload of an enumerate callback or get-identity response.
    /// Returns `None` if the frame is not 34 bytes long.
    pub fn parse(packet: &Packet) -> Option<Self> {
        if packet.len() != ENUMERATE_CALLBACK_SIZE {
            return None;
        }

        let payload = packet.payload();
        let mut uid = [0u8; 8];
        let mut connected_uid = [0u8; 8];
        let mut hardware_version = [0u8; 3];
        let mut firmware_version = [0u8; 3];

        uid.copy_from_slice(&payload[0..8]);
        connected_uid.copy_from_slice(&payload[8..16]);
        hardware_version.copy_from_slice(&payload[17..20]);
        firmware_version.copy_from_slice(&payload[20..23]);

        Some(Self {
            uid,
            connected_uid,
            position: payload[16],
            hardware_version,
            firmware_version,
            device_identifier: u16::from_le_bytes([payload[23], payload[24]]),
            enumeration_type: EnumerationType::from_wire(payload[25]),
        })
    }

    /// Write this callback back into the payload of `packet`. The packet
    /// must already be a 34-byte frame.
    pub fn store(&self, packet: &mut Packet) {
        debug_assert_eq!(packet.len(), ENUMERATE_CALLBACK_SIZE);

        let payload = packet.payload_mut();
        payload[0..8].copy_from_slice(&self.uid);
        payload[8..16].copy_from_slice(&self.connected_uid);
        payload[16] = self.position;
        payload[17..20].copy_from_slice(&self.hardware_version);
        payload[20..23].copy_from_slice(&self.firmware_version);
        payload[23..25].copy_from_slice(&self.device_identifier.to_le_bytes());
        payload[25] = self.enumeration_type.to_wire();
    }

    /// Replace the textual connected-uid, NUL-padding the field.
    pub fn set_connected_uid(&mut self, connected_uid: &str) {
        debug_assert!(connected_uid.len() <= 8);

        self.connected_uid = [0u8; 8];
        self.connected_uid[..connected_uid.len()].copy_from_slice(connected_uid.as_bytes());
    }

    pub fn connected_uid_str(&self) -> &str {
        let end = self
            .connected_uid
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.connected_uid.len());
        std::str::from_utf8(&self.connected_uid[..end]).unwrap_or("")
    }

    pub fn uid_str(&self) -> &str {
        let end = self.uid.iter().position(|&b| b == 0).unwrap_or(self.uid.len());
        std::str::from_utf8(&self.uid[..end]).unwrap_or("")
    }
}

/// Subtype of an enumerate callback, `None` for any other function.
pub fn callback_subtype(packet: &Packet) -> Option<EnumerationType> {
    if packet.header.function_id != function::CALLBACK_ENUMERATE {
        return None;
    }

    EnumerateCallback::parse(packet).map(|callback| callback.enumeration_type)
}

/// Build the synthetic enumerate-disconnected callback a stack emits for
/// each of its UIDs when it goes away.
pub fn disconnected_callback(uid: u32) -> Packet {
    let mut header = Header {
        uid,
        length: 0, // set by Packet::new
        function_id: function::CALLBACK_ENUMERATE,
        sequence_number_and_options: 0,
        error_code_and_future_use: 0,
    };
    header.set_response_expected(true);

    let mut callback = EnumerateCallback {
        uid: [0u8; 8],
        connected_uid: [0u8; 8],
        position: b'0',
        hardware_version: [0; 3],
        firmware_version: [0; 3],
        device_identifier: 0,
        enumeration_type: EnumerationType::Disconnected,
    };

    let encoded = base58::encode(uid);
    callback.uid[..encoded.len()].copy_from_slice(encoded.as_bytes());

    let mut packet = Packet::new(header, &[0u8; ENUMERATE_PAYLOAD_SIZE]);
    callback.store(&mut packet);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketError;

    fn sample_callback() -> Packet {
        let mut header = Header {
            uid: 3255,
            length: 0,
            function_id: function::CALLBACK_ENUMERATE,
            sequence_number_and_options: 0x08,
            error_code_and_future_use: 0,
        };
        header.set_response_expected(true);

        let mut packet = Packet::new(header, &[0u8; ENUMERATE_PAYLOAD_SIZE]);
        let callback = EnumerateCallback {
            uid: *b"abc\0\0\0\0\0",
            connected_uid: *b"def\0\0\0\0\0",
            position: b'0',
            hardware_version: [1, 0, 0],
            firmware_version: [2, 1, 0],
            device_identifier: 25,
            enumeration_type: EnumerationType::Connected,
        };
        callback.store(&mut packet);
        packet
    }

    #[test]
    fn parse_store_roundtrip() {
        let packet = sample_callback();
        let callback = EnumerateCallback::parse(&packet).unwrap();

        assert_eq!(callback.uid_str(), "abc");
        assert_eq!(callback.connected_uid_str(), "def");
        assert_eq!(callback.position, b'0');
        assert_eq!(callback.device_identifier, 25);
        assert_eq!(callback.enumeration_type, EnumerationType::Connected);

        let mut copy = packet;
        callback.store(&mut copy);
        assert_eq!(copy, packet);
    }

    #[test]
    fn subtype_only_for_enumerate() {
        let packet = sample_callback();
        assert_eq!(
            callback_subtype(&packet),
            Some(EnumerationType::Connected)
        );

        let mut other = packet;
        other.header.function_id = 7;
        assert_eq!(callback_subtype(&other), None);
    }

    #[test]
    fn disconnected_callback_is_valid_response() {
        let packet = disconnected_callback(0xdead_beef);

        assert_eq!(packet.len(), ENUMERATE_CALLBACK_SIZE);
        assert_eq!(packet.header.sequence_number(), 0);
        assert_eq!(packet.header.validate_response(), Ok::<(), PacketError>(()));

        let callback = EnumerateCallback::parse(&packet).unwrap();
        assert_eq!(callback.uid_str(), base58::encode(0xdead_beef));
        assert_eq!(callback.enumeration_type, EnumerationType::Disconnected);
    }

    #[test]
    fn set_connected_uid_pads_with_nul() {
        let packet = sample_callback();
        let mut callback = EnumerateCallback::parse(&packet).unwrap();

        callback.set_connected_uid("xy");
        assert_eq!(callback.connected_uid_str(), "xy");
        assert_eq!(&callback.connected_uid[2..], &[0u8; 6]);
    }
}
