//! Per-notification mutual exclusion and delayed timers.
//!
//! Every path that mutates a notification (send callback, timer, acknowledgment)
//! runs under the notification's [`KeyedLocks`] entry. Timers are kept in a
//! single slot per notification with a generation counter: scheduling a new
//! timer cancels the previous one, and a timer that wakes must still be the
//! current generation before it acts.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Async mutexes keyed by string id. Entries are dropped when the last guard goes.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        KeyedGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held lock for one key.
#[derive(Debug)]
pub struct KeyedGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map still references the mutex: nobody holds or waits on it.
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Acknowledgments in flight, counted per batch.
///
/// An acknowledgment registers before it waits on the notification lock, so a
/// timer that already holds the lock can see it coming and stand down.
#[derive(Debug, Default)]
pub struct PendingAcks {
    batches: Arc<DashMap<String, usize>>,
}

impl PendingAcks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, batch_id: &str) -> PendingAckGuard {
        *self.batches.entry(batch_id.to_string()).or_insert(0) += 1;
        PendingAckGuard {
            batch_id: batch_id.to_string(),
            batches: Arc::clone(&self.batches),
        }
    }

    pub fn is_pending(&self, batch_id: &str) -> bool {
        self.batches.get(batch_id).is_some_and(|count| *count > 0)
    }
}

/// Registration of one in-flight acknowledgment; released on drop.
#[derive(Debug)]
pub struct PendingAckGuard {
    batch_id: String,
    batches: Arc<DashMap<String, usize>>,
}

impl Drop for PendingAckGuard {
    fn drop(&mut self) {
        if let Some(mut count) = self.batches.get_mut(&self.batch_id) {
            *count = count.saturating_sub(1);
        }
        self.batches.remove_if(&self.batch_id, |_, count| *count == 0);
    }
}

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum TimerKind {
    /// Backoff before re-sending on the same channel.
    Retry,
    /// End of the acknowledgment window.
    Deadline,
}

/// Identity of a scheduled timer, handed to the callback when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerTicket {
    pub key: String,
    pub generation: u64,
    pub kind: TimerKind,
}

#[derive(Debug)]
struct TimerSlot {
    generation: u64,
    kind: TimerKind,
    token: CancellationToken,
}

/// Single-slot timers keyed by notification id.
#[derive(Debug)]
pub struct TimerScheduler {
    next_generation: AtomicU64,
    slots: DashMap<String, TimerSlot>,
    shutdown: CancellationToken,
}

impl TimerScheduler {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            next_generation: AtomicU64::new(1),
            slots: DashMap::new(),
            shutdown,
        }
    }

    /// Schedule `fire` after `delay`, replacing any timer already set for `key`.
    pub fn schedule<F, Fut>(&self, key: &str, kind: TimerKind, delay: Duration, fire: F) -> TimerTicket
    where
        F: FnOnce(TimerTicket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        let ticket = TimerTicket {
            key: key.to_string(),
            generation,
            kind,
        };

        if let Some(previous) = self.slots.insert(
            key.to_string(),
            TimerSlot {
                generation,
                kind,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
        }
        trace!(key, generation, kind = %kind, delay_ms = delay.as_millis() as u64, "Timer scheduled");

        let fired = ticket.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {},
            }
            fire(fired).await;
        });
        ticket
    }

    /// Cancel whatever timer is set for `key`.
    pub fn cancel(&self, key: &str) -> bool {
        match self.slots.remove(key) {
            Some((_, slot)) => {
                slot.token.cancel();
                trace!(key, generation = slot.generation, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether `ticket` is still the live timer for its key.
    pub fn is_current(&self, ticket: &TimerTicket) -> bool {
        self.slots.get(&ticket.key).is_some_and(|slot| {
            slot.generation == ticket.generation && !slot.token.is_cancelled()
        })
    }

    /// Clear the slot after a timer ran, unless it was replaced meanwhile.
    pub fn complete(&self, ticket: &TimerTicket) {
        self.slots
            .remove_if(&ticket.key, |_, slot| slot.generation == ticket.generation);
    }

    /// Kind of the timer currently set for `key`.
    pub fn pending_kind(&self, key: &str) -> Option<TimerKind> {
        self.slots.get(key).map(|slot| slot.kind)
    }

    pub fn pending(&self) -> usize {
        self.slots.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.slots.clear();
    }
}
