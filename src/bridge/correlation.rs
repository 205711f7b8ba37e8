//! Correlation table: in-flight uid -> gate
//!
//! Independent lock from the backlog, so a slow lookup never blocks enqueue.

use super::Gate;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::error;

/// A dispatched request awaiting its response
#[derive(Debug)]
pub struct InFlight {
    pub gate: Arc<Gate>,
    pub indev: u32,
    pub dispatched_at: Instant,
}

impl InFlight {
    pub fn new(gate: Arc<Gate>, indev: u32) -> Self {
        Self {
            gate,
            indev,
            dispatched_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<u32, InFlight>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, InFlight>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new in-flight uid. An existing entry is never replaced.
    pub fn insert(&self, uid: u32, in_flight: InFlight) -> Result<()> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&uid) {
            error!(
                uid,
                in_flight_for = ?existing.dispatched_at.elapsed(),
                "uid reused while still in flight, keeping the original request"
            );
            return Err(Error::DuplicateUid { uid });
        }
        entries.insert(uid, in_flight);
        Ok(())
    }

    pub fn take(&self, uid: u32) -> Option<InFlight> {
        self.lock().remove(&uid)
    }

    /// Remove `uid` only if it is still owned by `gate`
    pub fn take_if(&self, uid: u32, gate: &Arc<Gate>) -> Option<InFlight> {
        let mut entries = self.lock();
        match entries.get(&uid) {
            Some(in_flight) if Arc::ptr_eq(&in_flight.gate, gate) => entries.remove(&uid),
            _ => None,
        }
    }

    pub fn contains(&self, uid: u32) -> bool {
        self.lock().contains_key(&uid)
    }

    /// Empty the table, returning every in-flight entry
    pub fn drain(&self) -> Vec<(u32, InFlight)> {
        self.lock().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
