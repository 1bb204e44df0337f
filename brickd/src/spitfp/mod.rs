//! SPITFP: the reliable, Pearson-checksummed SPI framing between the
//! daemon and directly attached Bricklet co-processors.

pub mod frame;
pub mod hal;
pub mod link;
pub mod parser;

pub use link::{SpiLink, SpiLinkConfig};
