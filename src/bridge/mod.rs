//! Packet verdict bridge
//!
//! Turns the synchronous per-packet kernel callback into a request/response
//! exchange with the decision process:
//!
//! ```text
//! kernel thread --enqueue--> Backlog --drain--> Dispatcher --send--> decision process
//!      ^                                            |                      |
//!      |                                      CorrelationTable <--recv-----+
//!      +--------------- Gate <----resolve-----------+
//! ```
//!
//! Every submitted packet leaves with exactly one verdict: the decision
//! process's answer, the timeout fallback, or accept on any internal failure
//! (capture, send, protocol, shutdown).

mod backlog;
mod channel;
mod correlation;
mod dispatcher;
mod gate;
mod liveness;

pub use backlog::{Backlog, BacklogEntry};
pub use channel::{DecisionChannel, Transport};
pub use correlation::{CorrelationTable, InFlight};
pub use dispatcher::Dispatcher;
pub use gate::Gate;
pub use liveness::Liveness;

use crate::capture::CapturedPacket;
use crate::config::VerdictConfig;
use crate::telemetry::BridgeMetrics;
use crate::wire::{PacketRecord, Verdict};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared state of one bridge instance
#[derive(Debug)]
pub struct Bridge {
    backlog: Backlog,
    table: CorrelationTable,
    liveness: Arc<Liveness>,
    metrics: Arc<BridgeMetrics>,
    policy: VerdictConfig,
}

impl Bridge {
    pub fn new(policy: VerdictConfig) -> Self {
        Self {
            backlog: Backlog::new(),
            table: CorrelationTable::new(),
            liveness: Arc::new(Liveness::new()),
            metrics: Arc::new(BridgeMetrics::new()),
            policy,
        }
    }

    /// Decide on a captured packet, blocking until the verdict is known.
    ///
    /// Never fails: capture problems and shutdown resolve to accept, a
    /// missing answer resolves to the configured fallback.
    pub fn decide<P: CapturedPacket + ?Sized>(&self, packet: &P) -> Verdict {
        let verdict = self.decide_inner(packet);
        self.metrics.record_verdict(packet.indev(), verdict);
        verdict
    }

    fn decide_inner<P: CapturedPacket + ?Sized>(&self, packet: &P) -> Verdict {
        let uid = packet.packet_id();

        let Some(record) = capture(packet) else {
            self.metrics.capture_failures.inc();
            debug!(uid, "timestamp or payload unavailable, accepting");
            return Verdict::Accept;
        };
        self.metrics
            .record_packet(record.indev, record.payload().len());

        match self.submit(record) {
            Ok(gate) => self.wait(uid, &gate),
            Err(_) => {
                self.metrics.refused.inc();
                debug!(uid, "bridge shutting down, accepting");
                Verdict::Accept
            }
        }
    }

    /// Queue a record for the dispatcher without waiting for its verdict
    pub fn submit(&self, record: PacketRecord) -> Result<Arc<Gate>> {
        if !self.liveness.is_alive() {
            return Err(crate::Error::ShuttingDown);
        }

        let gate = Arc::new(Gate::new());
        self.backlog
            .enqueue(BacklogEntry::new(record, gate.clone()))?;
        Ok(gate)
    }

    /// Block on `gate` for at most the configured timeout
    pub fn wait(&self, uid: u32, gate: &Arc<Gate>) -> Verdict {
        let Some(timeout) = self.policy.timeout() else {
            return gate.wait();
        };

        if let Some(verdict) = gate.wait_timeout(timeout) {
            return verdict;
        }

        let fallback = self.policy.fallback_verdict();
        if !gate.resolve(fallback) {
            // Dispatcher got there first
            return gate.state().unwrap_or(fallback);
        }

        self.table.take_if(uid, gate);
        self.metrics.timeouts.inc();
        warn!(
            uid,
            timeout_ms = timeout.as_millis() as u64,
            %fallback,
            "no verdict in time, using fallback"
        );
        fallback
    }

    /// Stop the bridge and release every pending gate
    pub fn shutdown(&self) {
        self.liveness.shutdown();
        self.release_all();
    }

    /// Resolve every queued and in-flight gate to accept
    pub(crate) fn release_all(&self) -> usize {
        let queued = self.backlog.close();
        let in_flight = self.table.drain();

        let released = queued
            .into_iter()
            .map(|entry| entry.gate)
            .chain(in_flight.into_iter().map(|(_, in_flight)| in_flight.gate))
            .filter(|gate| gate.resolve(Verdict::Accept))
            .count();

        if released > 0 {
            self.metrics.released.add(released as u64);
            info!("released {} pending packets with accept", released);
        }
        released
    }

    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    pub fn table(&self) -> &CorrelationTable {
        &self.table
    }

    pub fn liveness(&self) -> &Arc<Liveness> {
        &self.liveness
    }

    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.metrics
    }
}

/// Snapshot a packet, or `None` if the kernel did not provide everything
fn capture<P: CapturedPacket + ?Sized>(packet: &P) -> Option<PacketRecord> {
    let timestamp = packet.timestamp()?;
    let payload = packet.payload()?;
    Some(PacketRecord::new(
        packet.packet_id(),
        packet.indev(),
        timestamp,
        payload,
    ))
}
