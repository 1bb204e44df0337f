//! Wire model for the Tinkerforge Protocol (TFP).
//!
//! Every frame exchanged between API clients, the Brick Daemon and devices is
//! an 8-byte little-endian header followed by up to 72 payload bytes. This
//! crate holds the header/packet layout, validation, the enumerate callback
//! layout and base58 UID handling. It performs no I/O.

pub mod base58;
pub mod enumerate;
pub mod packet;

pub use enumerate::{EnumerateCallback, EnumerationType};
pub use packet::{ErrorCode, Header, Packet, PacketError};
