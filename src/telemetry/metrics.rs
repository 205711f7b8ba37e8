//! Metrics collection for verdict statistics.
//!
//! Provides thread-safe counters shared by the kernel-facing threads and the
//! dispatcher, at both the global and per-device level.

use crate::wire::Verdict;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per input device statistics.
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub packets: Counter,
    pub bytes: Counter,
    pub dropped: Counter,
}

/// Metrics for one bridge instance.
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    /// Keyed by input interface index.
    devices: RwLock<HashMap<u32, DeviceStats>>,

    /// Packets handed to the bridge by the kernel-facing side.
    pub submitted: Counter,
    /// Request frames written to the decision channel.
    pub dispatched: Counter,
    /// Verdicts returned to the kernel, by outcome.
    pub accepted: Counter,
    pub dropped: Counter,

    // Fail-open paths
    /// Timestamp or payload could not be captured.
    pub capture_failures: Counter,
    /// Request could not be written to the channel.
    pub send_failures: Counter,
    /// Response carried an unknown verdict code.
    pub protocol_violations: Counter,
    /// Uid was already in flight when dispatched.
    pub duplicate_uids: Counter,
    /// Submissions refused because the bridge was shutting down.
    pub refused: Counter,

    /// Waiters that gave up and used the fallback verdict.
    pub timeouts: Counter,
    /// Responses with no matching in-flight uid.
    pub stale_responses: Counter,
    /// Gates forced to accept during shutdown.
    pub released: Counter,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a captured packet on its input device.
    pub fn record_packet(&self, indev: u32, bytes: usize) {
        self.submitted.inc();

        if let Some(stats) = self.read_devices().get(&indev) {
            stats.packets.inc();
            stats.bytes.add(bytes as u64);
            return;
        }

        let mut devices = self.devices.write().unwrap_or_else(PoisonError::into_inner);
        let stats = devices.entry(indev).or_default();
        stats.packets.inc();
        stats.bytes.add(bytes as u64);
    }

    /// Records the verdict returned to the kernel.
    pub fn record_verdict(&self, indev: u32, verdict: Verdict) {
        match verdict {
            Verdict::Accept => self.accepted.inc(),
            Verdict::Drop => {
                self.dropped.inc();
                if let Some(stats) = self.read_devices().get(&indev) {
                    stats.dropped.inc();
                }
            }
        }
    }

    fn read_devices(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u32, DeviceStats>> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exports all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut result = vec![
            ("submitted".into(), self.submitted.get()),
            ("dispatched".into(), self.dispatched.get()),
            ("accepted".into(), self.accepted.get()),
            ("dropped".into(), self.dropped.get()),
            ("capture_failures".into(), self.capture_failures.get()),
            ("send_failures".into(), self.send_failures.get()),
            ("protocol_violations".into(), self.protocol_violations.get()),
            ("duplicate_uids".into(), self.duplicate_uids.get()),
            ("refused".into(), self.refused.get()),
            ("timeouts".into(), self.timeouts.get()),
            ("stale_responses".into(), self.stale_responses.get()),
            ("released".into(), self.released.get()),
        ];

        let devices = self.read_devices();
        let mut indexes: Vec<&u32> = devices.keys().collect();
        indexes.sort();
        for indev in indexes {
            let stats = &devices[indev];
            result.extend([
                (format!("dev{}_packets", indev), stats.packets.get()),
                (format!("dev{}_bytes", indev), stats.bytes.get()),
                (format!("dev{}_dropped", indev), stats.dropped.get()),
            ]);
        }

        result
    }
}
