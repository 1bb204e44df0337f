//! Brick Daemon core: routes Tinkerforge Protocol packets between
//! TCP/WebSocket API clients and devices attached via USB, SPI (SPITFP)
//! and mesh gateways.

pub mod auth;
pub mod bricklet;
pub mod client;
pub mod config;
pub mod daemon;
pub mod hardware;
pub mod mesh;
pub mod metrics;
pub mod network;
pub mod reactor;
pub mod ring;
pub mod router;
pub mod spitfp;
pub mod stack;
pub mod timer;
pub mod usb;
pub mod websocket;

pub use config::Config;
pub use daemon::Daemon;
pub use metrics::Metrics;
