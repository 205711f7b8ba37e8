//! Single-use verdict gate
//!
//! Carries exactly one verdict from the dispatcher (or a timed-out waiter) to
//! the kernel-facing thread blocked on it.

use crate::wire::Verdict;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<Option<Verdict>>,
    ready: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Verdict>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move the gate out of pending. Returns false if it was already resolved,
    /// in which case the earlier verdict stands.
    pub fn resolve(&self, verdict: Verdict) -> bool {
        let mut state = self.lock();
        if state.is_some() {
            return false;
        }
        *state = Some(verdict);
        drop(state);

        self.ready.notify_all();
        true
    }

    /// Current verdict, `None` while pending
    pub fn state(&self) -> Option<Verdict> {
        *self.lock()
    }

    pub fn is_resolved(&self) -> bool {
        self.state().is_some()
    }

    /// Block until the gate is resolved
    pub fn wait(&self) -> Verdict {
        let mut state = self.lock();
        loop {
            if let Some(verdict) = *state {
                return verdict;
            }
            state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the gate is resolved or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Verdict> {
        let state = self.lock();
        let (state, _) = self
            .ready
            .wait_timeout_while(state, timeout, |state| state.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_resolves_once() {
        let gate = Gate::new();
        assert_eq!(gate.state(), None);

        assert!(gate.resolve(Verdict::Drop));
        assert!(!gate.resolve(Verdict::Accept));
        assert_eq!(gate.state(), Some(Verdict::Drop));
        assert_eq!(gate.wait(), Verdict::Drop);
    }

    #[test]
    fn test_resolved_before_wait() {
        let gate = Gate::new();
        gate.resolve(Verdict::Accept);
        assert_eq!(gate.wait_timeout(Duration::from_millis(1)), Some(Verdict::Accept));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let gate = Gate::new();
        let started = Instant::now();
        assert_eq!(gate.wait_timeout(Duration::from_millis(20)), None);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(!gate.is_resolved());
    }

    #[test]
    fn test_wakes_blocked_waiter() {
        let gate = Arc::new(Gate::new());
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait())
        };

        thread::sleep(Duration::from_millis(10));
        gate.resolve(Verdict::Drop);
        assert_eq!(waiter.join().unwrap(), Verdict::Drop);
    }

    #[test]
    fn test_no_missed_wakeup_randomized() {
        let mut rng = rand::rng();

        for round in 0..200 {
            let gate = Arc::new(Gate::new());
            let waiter_delay = Duration::from_micros(rng.random_range(0..300));
            let resolver_delay = Duration::from_micros(rng.random_range(0..300));
            let verdict = if round % 2 == 0 {
                Verdict::Accept
            } else {
                Verdict::Drop
            };

            let waiter = {
                let gate = gate.clone();
                thread::spawn(move || {
                    thread::sleep(waiter_delay);
                    gate.wait_timeout(Duration::from_secs(5))
                })
            };
            thread::sleep(resolver_delay);
            assert!(gate.resolve(verdict));

            assert_eq!(waiter.join().unwrap(), Some(verdict), "round {}", round);
        }
    }
}
