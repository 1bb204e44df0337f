//! Wire format of the mesh gateway protocol: a 17-byte header framing
//! session management packets and tunnelled TFP payloads.

use thiserror::Error;

use tfp::Packet;

pub const MESH_ADDRESS_LENGTH: usize = 6;
pub const MESH_HEADER_LENGTH: usize = 17;

/// Inbound frames are accumulated in a fixed buffer of this size.
pub const MESH_RESPONSE_BUFFER_LENGTH: usize = 512;

pub const BROADCAST_ADDRESS: [u8; MESH_ADDRESS_LENGTH] = [0; MESH_ADDRESS_LENGTH];

/// Payload protocol nibble carried in the flags; everything but binary is
/// rejected.
pub const PROTOCOL_BINARY: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Downward, // gateway to mesh
    Upward,   // mesh to gateway
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshPacketType {
    Hello,
    Olleh,
    Reset,
    HeartBeatPing,
    HeartBeatPong,
    Tfp,
}

impl MeshPacketType {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(MeshPacketType::Hello),
            2 => Some(MeshPacketType::Olleh),
            3 => Some(MeshPacketType::Reset),
            4 => Some(MeshPacketType::HeartBeatPing),
            5 => Some(MeshPacketType::HeartBeatPong),
            6 => Some(MeshPacketType::Tfp),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            MeshPacketType::Hello => 1,
            MeshPacketType::Olleh => 2,
            MeshPacketType::Reset => 3,
            MeshPacketType::HeartBeatPing => 4,
            MeshPacketType::HeartBeatPong => 5,
            MeshPacketType::Tfp => 6,
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MeshPacketError {
    #[error("mesh packet header length is too small")]
    LengthTooSmall,
    #[error("mesh packet length exceeds the response buffer")]
    LengthTooBig,
    #[error("mesh packet header has downward direction")]
    DownwardDirection,
    #[error("mesh packet payload type is not binary")]
    NotBinary,
}

/// The mesh header: `flags` u16, total `length` u16 (header included), a
/// destination and a source address and the packet type. In the high flags
/// byte bit 0 is the direction, bit 1 p2p, bits 2..7 the payload protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshPacketHeader {
    pub flags: u16,
    pub length: u16,
    pub dst_addr: [u8; MESH_ADDRESS_LENGTH],
    pub src_addr: [u8; MESH_ADDRESS_LENGTH],
    pub packet_type: u8,
}

impl MeshPacketHeader {
    pub fn new(
        direction: Direction,
        p2p: bool,
        protocol: u8,
        length: u16,
        dst_addr: [u8; MESH_ADDRESS_LENGTH],
        src_addr: [u8; MESH_ADDRESS_LENGTH],
        packet_type: MeshPacketType,
    ) -> Self {
        let mut header = Self {
            flags: 0,
            length,
            dst_addr,
            src_addr,
            packet_type: packet_type.to_wire(),
        };

        header.set_direction(direction);
        header.set_p2p(p2p);
        header.set_protocol(protocol);
        header
    }

    pub fn from_bytes(bytes: &[u8; MESH_HEADER_LENGTH]) -> Self {
        let mut dst_addr = [0u8; MESH_ADDRESS_LENGTH];
        let mut src_addr = [0u8; MESH_ADDRESS_LENGTH];
        dst_addr.copy_from_slice(&bytes[4..10]);
        src_addr.copy_from_slice(&bytes[10..16]);

        Self {
            flags: u16::from_le_bytes([bytes[0], bytes[1]]),
            length: u16::from_le_bytes([bytes[2], bytes[3]]),
            dst_addr,
            src_addr,
            packet_type: bytes[16],
        }
    }

    pub fn to_bytes(&self) -> [u8; MESH_HEADER_LENGTH] {
        let mut bytes = [0u8; MESH_HEADER_LENGTH];
        bytes[0..2].copy_from_slice(&self.flags.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..10].copy_from_slice(&self.dst_addr);
        bytes[10..16].copy_from_slice(&self.src_addr);
        bytes[16] = self.packet_type;
        bytes
    }

    pub fn direction(&self) -> Direction {
        if (self.flags >> 8) & 0x01 == 1 {
            Direction::Upward
        } else {
            Direction::Downward
        }
    }

    pub fn set_direction(&mut self, direction: Direction) {
        match direction {
            Direction::Upward => self.flags |= 1 << 8,
            Direction::Downward => self.flags &= !(1 << 8),
        }
    }

    pub fn p2p(&self) -> bool {
        (self.flags >> 9) & 0x01 == 1
    }

    pub fn set_p2p(&mut self, p2p: bool) {
        if p2p {
            self.flags |= 1 << 9;
        } else {
            self.flags &= !(1 << 9);
        }
    }

    pub fn protocol(&self) -> u8 {
        ((self.flags >> 8) as u8) >> 2
    }

    pub fn set_protocol(&mut self, protocol: u8) {
        let mut high = (self.flags >> 8) as u8;
        high &= 0x03;
        high |= protocol << 2;
        self.flags = (self.flags & 0x00ff) | ((high as u16) << 8);
    }

    pub fn mesh_packet_type(&self) -> Option<MeshPacketType> {
        MeshPacketType::from_wire(self.packet_type)
    }

    /// Validate a header received from the mesh.
    pub fn validate_response(&self) -> Result<(), MeshPacketError> {
        if (self.length as usize) < MESH_HEADER_LENGTH {
            return Err(MeshPacketError::LengthTooSmall);
        }

        if (self.length as usize) > MESH_RESPONSE_BUFFER_LENGTH {
            return Err(MeshPacketError::LengthTooBig);
        }

        if self.direction() != Direction::Upward {
            return Err(MeshPacketError::DownwardDirection);
        }

        if self.protocol() != PROTOCOL_BINARY {
            return Err(MeshPacketError::NotBinary);
        }

        Ok(())
    }
}

/// Payload of a hello packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshHelloPayload {
    pub is_root_node: bool,
    pub group_id: [u8; 6],
    pub prefix: [u8; 16],
    pub firmware_version: [u8; 3],
}

impl MeshHelloPayload {
    pub const LENGTH: usize = 26;

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::LENGTH {
            return None;
        }

        let mut group_id = [0u8; 6];
        let mut prefix = [0u8; 16];
        let mut firmware_version = [0u8; 3];
        group_id.copy_from_slice(&payload[1..7]);
        prefix.copy_from_slice(&payload[7..23]);
        firmware_version.copy_from_slice(&payload[23..26]);

        Some(Self {
            is_root_node: payload[0] != 0,
            group_id,
            prefix,
            firmware_version,
        })
    }

    pub fn prefix_str(&self) -> String {
        let end = self
            .prefix
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.prefix.len());
        String::from_utf8_lossy(&self.prefix[..end]).into_owned()
    }
}

fn header_only_packet(
    dst_addr: [u8; MESH_ADDRESS_LENGTH],
    src_addr: [u8; MESH_ADDRESS_LENGTH],
    packet_type: MeshPacketType,
) -> Vec<u8> {
    MeshPacketHeader::new(
        Direction::Downward,
        false,
        PROTOCOL_BINARY,
        MESH_HEADER_LENGTH as u16,
        dst_addr,
        src_addr,
        packet_type,
    )
    .to_bytes()
    .to_vec()
}

pub fn olleh_packet(
    dst_addr: [u8; MESH_ADDRESS_LENGTH],
    src_addr: [u8; MESH_ADDRESS_LENGTH],
) -> Vec<u8> {
    header_only_packet(dst_addr, src_addr, MeshPacketType::Olleh)
}

pub fn ping_packet(
    dst_addr: [u8; MESH_ADDRESS_LENGTH],
    src_addr: [u8; MESH_ADDRESS_LENGTH],
) -> Vec<u8> {
    header_only_packet(dst_addr, src_addr, MeshPacketType::HeartBeatPing)
}

pub fn pong_packet(
    dst_addr: [u8; MESH_ADDRESS_LENGTH],
    src_addr: [u8; MESH_ADDRESS_LENGTH],
) -> Vec<u8> {
    header_only_packet(dst_addr, src_addr, MeshPacketType::HeartBeatPong)
}

/// Reset is broadcast to the all-zero address.
pub fn reset_packet() -> Vec<u8> {
    header_only_packet(BROADCAST_ADDRESS, BROADCAST_ADDRESS, MeshPacketType::Reset)
}

/// Wrap one TFP request for the mesh, downward from the gateway.
pub fn tfp_packet(
    dst_addr: [u8; MESH_ADDRESS_LENGTH],
    src_addr: [u8; MESH_ADDRESS_LENGTH],
    payload: &Packet,
) -> Vec<u8> {
    let header = MeshPacketHeader::new(
        Direction::Downward,
        false,
        PROTOCOL_BINARY,
        (MESH_HEADER_LENGTH + payload.len()) as u16,
        dst_addr,
        src_addr,
        MeshPacketType::Tfp,
    );

    let mut bytes = header.to_bytes().to_vec();
    bytes.extend_from_slice(&payload.to_bytes());
    bytes
}
