//! Kernel packet queue side
//!
//! The kernel queue hands over packets one batch at a time and expects one
//! verdict per packet id. `serve` is the outer receive loop feeding those
//! packets through the bridge.

mod nfqueue;

pub use nfqueue::{NfQueue, QueuedPacket};

use crate::bridge::Bridge;
use crate::wire::{Timeval, Verdict};
use crate::Result;
use tracing::{error, info, warn};

/// A packet delivered by the kernel queue
///
/// Accessors return `None` when the kernel did not supply the field; the
/// bridge accepts such packets without consulting the decision process.
pub trait CapturedPacket {
    fn packet_id(&self) -> u32;
    fn indev(&self) -> u32;
    fn timestamp(&self) -> Option<Timeval>;
    fn payload(&self) -> Option<&[u8]>;
}

/// Kernel packet queue backend
pub trait PacketQueue {
    type Packet: CapturedPacket;

    /// Receive the next batch. An empty batch means the poll interval passed.
    fn recv(&mut self) -> Result<Vec<Self::Packet>>;

    /// Issue the verdict for one packet id
    fn set_verdict(&mut self, packet_id: u32, verdict: Verdict) -> Result<()>;
}

/// Run the receive loop until the bridge's liveness flag is cleared.
///
/// A receive error is fatal: it clears the flag so the dispatcher stops too.
pub fn serve<Q: PacketQueue>(queue: &mut Q, bridge: &Bridge) -> Result<()> {
    info!("receive loop started");

    while bridge.liveness().is_alive() {
        let packets = match queue.recv() {
            Ok(packets) => packets,
            Err(e) => {
                error!("packet queue receive failed: {}", e);
                bridge.liveness().shutdown();
                return Err(e);
            }
        };

        for packet in packets {
            let uid = packet.packet_id();
            let verdict = bridge.decide(&packet);
            if let Err(e) = queue.set_verdict(uid, verdict) {
                warn!(uid, %verdict, "failed to issue verdict: {}", e);
            }
        }
    }

    info!("receive loop stopped");
    Ok(())
}

/// In-memory packet for tests
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct TestPacket {
    pub id: u32,
    pub indev: u32,
    pub timestamp: Option<Timeval>,
    pub payload: Option<Vec<u8>>,
}

#[cfg(test)]
impl TestPacket {
    pub fn new(id: u32, payload: &[u8]) -> Self {
        Self {
            id,
            indev: 1,
            timestamp: Some(Timeval::new(1_700_000_000, 0)),
            payload: Some(payload.to_vec()),
        }
    }
}

#[cfg(test)]
impl CapturedPacket for TestPacket {
    fn packet_id(&self) -> u32 {
        self.id
    }

    fn indev(&self) -> u32 {
        self.indev
    }

    fn timestamp(&self) -> Option<Timeval> {
        self.timestamp
    }

    fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }
}
