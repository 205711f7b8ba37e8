//! Decision channel wire protocol
//!
//! Fixed-size datagrams exchanged with the decision process. Every frame is
//! one whole datagram; there is no length prefix and no reassembly.

pub mod frame;
pub mod types;

pub use frame::{PacketRecord, RequestFrame, ResponseFrame};
pub use types::*;
