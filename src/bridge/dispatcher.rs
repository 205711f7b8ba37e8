//! Dispatcher loop
//!
//! Owns the decision channel. Moves backlog entries into the correlation
//! table, writes request frames, and resolves gates from response frames.
//! Waits on backlog work, incoming datagrams, send readiness and shutdown at
//! the same time, so neither side blocks the other. A peer that stops reading
//! holds up further requests but never the collection of responses.

use super::backlog::BacklogEntry;
use super::channel::Transport;
use super::correlation::InFlight;
use super::gate::Gate;
use super::{Bridge, DecisionChannel};
use crate::wire::frame::RESPONSE_SIZE;
use crate::wire::{ResponseFrame, Verdict, VerdictCode};
use crate::{Error, Result};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Oversized datagrams still show up as a size mismatch
const RECV_BUFFER_SIZE: usize = RESPONSE_SIZE * 8;

/// Request admitted to the correlation table, not yet on the wire
struct Outgoing {
    uid: u32,
    frame: Vec<u8>,
    gate: Arc<Gate>,
    enqueued_at: Instant,
}

pub struct Dispatcher<T = DecisionChannel> {
    bridge: Arc<Bridge>,
    channel: T,
    /// Head of line request refused with `WouldBlock`
    stalled: Option<Outgoing>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(bridge: Arc<Bridge>, channel: T) -> Self {
        Self {
            bridge,
            channel,
            stalled: None,
        }
    }

    /// Run until the liveness flag is cleared or the channel fails.
    ///
    /// On exit the flag is cleared and every pending gate is released to
    /// accept, so no submitter outlives the dispatcher.
    pub async fn run(mut self) -> Result<()> {
        info!("dispatcher started");
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        let bridge = self.bridge.clone();

        let result = loop {
            if !bridge.liveness().is_alive() {
                break Ok(());
            }

            tokio::select! {
                biased;
                _ = bridge.liveness().stopped() => break Ok(()),
                received = self.channel.recv(&mut buf) => match received {
                    Ok(len) => self.handle_response(&buf[..len]),
                    Err(e) => {
                        error!("decision channel receive failed: {}", e);
                        break Err(e);
                    }
                },
                ready = self.channel.send_ready(), if self.stalled.is_some() => match ready {
                    Ok(()) => self.flush(),
                    Err(e) => {
                        error!("decision channel send readiness failed: {}", e);
                        break Err(e);
                    }
                },
                _ = bridge.backlog().ready(), if self.stalled.is_none() => self.flush(),
            }
        };

        if bridge.liveness().shutdown() {
            warn!("dispatcher stopping the bridge");
        }
        self.stalled = None;
        bridge.release_all();
        info!("dispatcher stopped");
        result
    }

    /// Send the held request, then drain the backlog until empty or refused
    fn flush(&mut self) {
        loop {
            let outgoing = match self.stalled.take() {
                Some(outgoing) => outgoing,
                None => match self.bridge.backlog().drain_one() {
                    Some(entry) => match self.admit(entry) {
                        Some(outgoing) => outgoing,
                        None => continue,
                    },
                    None => return,
                },
            };

            if let Some(refused) = self.transmit(outgoing) {
                self.stalled = Some(refused);
                return;
            }
        }
    }

    /// Move an entry into the correlation table and encode its request
    fn admit(&self, entry: BacklogEntry) -> Option<Outgoing> {
        let BacklogEntry {
            record,
            gate,
            enqueued_at,
        } = entry;
        let uid = record.uid;
        let table = self.bridge.table();

        if gate.is_resolved() {
            debug!(uid, "submitter already settled, not dispatching");
            return None;
        }

        let in_flight = InFlight::new(gate.clone(), record.indev);
        if table.insert(uid, in_flight).is_err() {
            self.bridge.metrics().duplicate_uids.inc();
            gate.resolve(Verdict::Accept);
            return None;
        }

        // Waiter may have timed out between the check and the insert
        if gate.is_resolved() {
            table.take_if(uid, &gate);
            debug!(uid, "submitter settled during admission, not dispatching");
            return None;
        }

        Some(Outgoing {
            uid,
            frame: record.encode(),
            gate,
            enqueued_at,
        })
    }

    /// Write one request. Hands it back if the peer is not keeping up.
    fn transmit(&self, outgoing: Outgoing) -> Option<Outgoing> {
        let uid = outgoing.uid;
        let metrics = self.bridge.metrics();

        if outgoing.gate.is_resolved() {
            self.bridge.table().take_if(uid, &outgoing.gate);
            debug!(uid, "submitter settled before the request went out");
            return None;
        }

        match self.channel.try_send(&outgoing.frame) {
            Ok(()) => {
                metrics.dispatched.inc();
                trace!(
                    uid,
                    queued_for = ?outgoing.enqueued_at.elapsed(),
                    "request sent"
                );
                None
            }
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(uid, "decision process is not reading, holding request");
                Some(outgoing)
            }
            Err(e) => {
                metrics.send_failures.inc();
                warn!(uid, "failed to send request, accepting: {}", e);
                self.bridge.table().take_if(uid, &outgoing.gate);
                outgoing.gate.resolve(Verdict::Accept);
                None
            }
        }
    }

    fn handle_response(&mut self, datagram: &[u8]) {
        let metrics = self.bridge.metrics();

        let response = match ResponseFrame::parse(datagram) {
            Ok(response) => response,
            Err(e) => {
                metrics.protocol_violations.inc();
                warn!("discarding datagram: {}", e);
                return;
            }
        };
        let uid = response.uid;

        // Undecided: leave the entry in flight for a later response
        if response.code == VerdictCode::None {
            trace!(uid, "decision process has no verdict yet");
            return;
        }

        let Some(in_flight) = self.bridge.table().take(uid) else {
            metrics.stale_responses.inc();
            trace!(uid, "no request in flight, discarding response");
            return;
        };

        let verdict = match response.code.verdict() {
            Some(verdict) => verdict,
            None => {
                metrics.protocol_violations.inc();
                warn!(
                    uid,
                    code = response.code.as_u32(),
                    "unknown verdict code, accepting"
                );
                Verdict::Accept
            }
        };

        if in_flight.gate.resolve(verdict) {
            trace!(
                uid,
                %verdict,
                rtt = ?in_flight.dispatched_at.elapsed(),
                "verdict delivered"
            );
        } else {
            debug!(uid, "verdict arrived after the submitter settled");
        }
    }
}
