//! Process-wide liveness flag
//!
//! Set at startup, cleared exactly once by a shutdown trigger. The
//! dispatcher awaits the transition; the receive loop polls it.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug)]
pub struct Liveness {
    alive: AtomicBool,
    stopped: Notify,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            stopped: Notify::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Clear the flag. Returns true for the call that actually cleared it.
    pub fn shutdown(&self) -> bool {
        let was_alive = self.alive.swap(false, Ordering::AcqRel);
        if was_alive {
            self.stopped.notify_waiters();
        }
        was_alive
    }

    /// Resolves once the flag has been cleared
    pub async fn stopped(&self) {
        loop {
            let notified = self.stopped.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent shutdown is not lost
            notified.as_mut().enable();

            if !self.is_alive() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_shutdown_once() {
        let liveness = Liveness::new();
        assert!(liveness.is_alive());
        assert!(liveness.shutdown());
        assert!(!liveness.shutdown());
        assert!(!liveness.is_alive());
    }

    #[tokio::test]
    async fn test_stopped_after_shutdown() {
        let liveness = Liveness::new();
        liveness.shutdown();
        tokio::time::timeout(Duration::from_secs(1), liveness.stopped())
            .await
            .expect("already stopped");
    }

    #[tokio::test]
    async fn test_stopped_wakes_waiter() {
        let liveness = Arc::new(Liveness::new());
        let waiter = {
            let liveness = liveness.clone();
            tokio::spawn(async move { liveness.stopped().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        liveness.shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
