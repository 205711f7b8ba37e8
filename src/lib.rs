//! nfbridge - netfilter queue verdict bridge
//!
//! Packets diverted by an `NFQUEUE` rule are forwarded to an external
//! decision process over a local datagram socket; the kernel-facing thread
//! blocks until that process answers with accept or drop.

pub mod bridge;
pub mod capture;
pub mod config;
pub mod error;
pub mod telemetry;
pub mod wire;

pub use error::{Error, Result};
