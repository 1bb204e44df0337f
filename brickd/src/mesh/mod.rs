//! Mesh gateway support: TCP sessions from mesh root nodes, tunnelling TFP
//! over the mesh framing protocol.

pub mod packet;
pub mod stack;

pub use stack::{cleanup_sessions, create_session, MeshSession};
