//! Cancellable auto-release timers keyed by resource id.
//!
//! Each armed timer is a sleeping task that reports [`Expired`] on a channel
//! when it fires. Re-arming a resource aborts its previous task and bumps a
//! generation counter, so a timer that fired just before being re-armed is
//! recognised as stale by [`LeaseTimers::take_if_current`].

use std::collections::HashMap;
use std::time::Duration;

use realtyops_core::types::DbId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A timer fired for `resource_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub resource_id: DbId,
    pub generation: u64,
}

struct Entry {
    generation: u64,
    deadline: Instant,
    handle: JoinHandle<()>,
}

pub struct LeaseTimers {
    tx: mpsc::UnboundedSender<Expired>,
    entries: HashMap<DbId, Entry>,
    next_generation: u64,
}

impl LeaseTimers {
    /// Create an empty arena and the receiver its timers report to.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Expired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timers = Self {
            tx,
            entries: HashMap::new(),
            next_generation: 0,
        };
        (timers, rx)
    }

    /// Start (or restart) the timer for `resource_id`.
    pub fn arm(&mut self, resource_id: DbId, after: Duration) -> u64 {
        self.cancel(resource_id);

        self.next_generation += 1;
        let generation = self.next_generation;
        let deadline = Instant::now() + after;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(Expired {
                resource_id,
                generation,
            });
        });

        self.entries.insert(
            resource_id,
            Entry {
                generation,
                deadline,
                handle,
            },
        );
        generation
    }

    /// Stop the timer for `resource_id`. Returns `false` if none was armed.
    pub fn cancel(&mut self, resource_id: DbId) -> bool {
        match self.entries.remove(&resource_id) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Consume a fired timer. Returns `false` for a timer that was
    /// cancelled or re-armed after it fired.
    pub fn take_if_current(&mut self, expired: Expired) -> bool {
        match self.entries.get(&expired.resource_id) {
            Some(entry) if entry.generation == expired.generation => {
                self.entries.remove(&expired.resource_id);
                true
            }
            _ => false,
        }
    }

    /// Time left before `resource_id` fires.
    pub fn remaining(&self, resource_id: DbId) -> Option<Duration> {
        self.entries
            .get(&resource_id)
            .map(|e| e.deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_armed(&self, resource_id: DbId) -> bool {
        self.entries.contains_key(&resource_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cancel_all(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.handle.abort();
        }
    }
}

impl Drop for LeaseTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_delay() {
        let (mut timers, mut rx) = LeaseTimers::new();
        let generation = timers.arm(7, Duration::from_secs(300));

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(rx.try_recv().is_err());

        let expired = rx.recv().await.unwrap();
        assert_eq!(expired, Expired { resource_id: 7, generation });
        assert!(timers.take_if_current(expired));
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_resets_deadline() {
        let (mut timers, mut rx) = LeaseTimers::new();
        timers.arm(7, Duration::from_secs(300));
        tokio::time::advance(Duration::from_secs(200)).await;
        timers.arm(7, Duration::from_secs(300));

        tokio::time::advance(Duration::from_secs(200)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(timers.remaining(7), Some(Duration::from_secs(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_reports() {
        let (mut timers, mut rx) = LeaseTimers::new();
        timers.arm(7, Duration::from_secs(10));
        assert!(timers.cancel(7));
        assert!(!timers.cancel(7));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_is_ignored() {
        let (mut timers, _rx) = LeaseTimers::new();
        let old = timers.arm(7, Duration::from_secs(10));
        timers.arm(7, Duration::from_secs(10));
        assert!(!timers.take_if_current(Expired {
            resource_id: 7,
            generation: old,
        }));
        assert!(timers.is_armed(7));
    }
}
