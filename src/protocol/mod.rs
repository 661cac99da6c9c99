//! Parcela device protocol: topic layout, device payloads and control commands

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
