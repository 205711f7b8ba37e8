//! Backlog of records waiting to be dispatched
//!
//! Strict FIFO, many producers (kernel-facing threads) and one consumer (the
//! dispatcher). Enqueue wakes the dispatcher through a stored permit, so a
//! wakeup issued while the dispatcher is busy is not lost.

use super::Gate;
use crate::wire::PacketRecord;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;

/// A record paired with the gate its submitter waits on
#[derive(Debug)]
pub struct BacklogEntry {
    pub record: PacketRecord,
    pub gate: Arc<Gate>,
    pub enqueued_at: Instant,
}

impl BacklogEntry {
    pub fn new(record: PacketRecord, gate: Arc<Gate>) -> Self {
        Self {
            record,
            gate,
            enqueued_at: Instant::now(),
        }
    }
}

#[derive(Debug, Default)]
struct BacklogInner {
    entries: VecDeque<BacklogEntry>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct Backlog {
    inner: Mutex<BacklogInner>,
    ready: Notify,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BacklogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the tail. Fails once the backlog has been closed.
    pub fn enqueue(&self, entry: BacklogEntry) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.closed {
                return Err(Error::ShuttingDown);
            }
            inner.entries.push_back(entry);
        }

        self.ready.notify_one();
        Ok(())
    }

    /// Remove the head, if any
    pub fn drain_one(&self) -> Option<BacklogEntry> {
        self.lock().entries.pop_front()
    }

    /// Resolves when an enqueue happened since the last wakeup
    pub async fn ready(&self) {
        self.ready.notified().await
    }

    /// Refuse further entries and hand back everything still queued
    pub fn close(&self) -> Vec<BacklogEntry> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Timeval;
    use std::thread;
    use std::time::Duration;

    fn entry(uid: u32) -> BacklogEntry {
        BacklogEntry::new(
            PacketRecord::new(uid, 1, Timeval::default(), b"payload"),
            Arc::new(Gate::new()),
        )
    }

    #[test]
    fn test_fifo_order() {
        let backlog = Backlog::new();
        for uid in 1..=3 {
            backlog.enqueue(entry(uid)).unwrap();
        }

        assert_eq!(backlog.len(), 3);
        assert_eq!(backlog.drain_one().unwrap().record.uid, 1);
        assert_eq!(backlog.drain_one().unwrap().record.uid, 2);
        assert_eq!(backlog.drain_one().unwrap().record.uid, 3);
        assert!(backlog.drain_one().is_none());
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_closed_rejects_and_returns_leftovers() {
        let backlog = Backlog::new();
        backlog.enqueue(entry(1)).unwrap();
        backlog.enqueue(entry(2)).unwrap();

        let leftovers = backlog.close();
        assert_eq!(leftovers.len(), 2);
        assert!(matches!(backlog.enqueue(entry(3)), Err(Error::ShuttingDown)));
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_concurrent_producers() {
        let backlog = Arc::new(Backlog::new());
        let producers: Vec<_> = (0..4u32)
            .map(|t| {
                let backlog = backlog.clone();
                thread::spawn(move || {
                    for i in 0..100u32 {
                        backlog.enqueue(entry(t * 1000 + i)).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut seen = Vec::new();
        while let Some(entry) = backlog.drain_one() {
            seen.push(entry.record.uid);
        }
        assert_eq!(seen.len(), 400);

        // Per producer order is preserved
        for t in 0..4u32 {
            let mine: Vec<u32> = seen.iter().copied().filter(|uid| uid / 1000 == t).collect();
            let mut sorted = mine.clone();
            sorted.sort();
            assert_eq!(mine, sorted);
        }
    }

    #[tokio::test]
    async fn test_ready_permit_is_stored() {
        let backlog = Backlog::new();
        backlog.enqueue(entry(1)).unwrap();

        // Enqueue happened before anyone waited
        tokio::time::timeout(Duration::from_secs(1), backlog.ready())
            .await
            .expect("stored permit");
    }
}
