//! Debounced, coalesced issuance of remote calls keyed by content.
//! A request waits out the debounce window before its operation runs. A newer
//! request for the same key during the window supersedes it; a request that
//! arrives while the operation is in flight is coalesced and never runs.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::state_machine::{IssueSlot, IssueState};

/// How a debounced request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Debounced<T> {
    /// The window closed and the operation ran.
    Completed(T),
    /// A newer request for the same key took over during the window.
    Superseded,
    /// The key was already in flight; this request was folded into it.
    Coalesced,
}

impl<T> Debounced<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Debounced::Completed(value) => Some(value),
            _ => None,
        }
    }
}

struct Entry {
    slot: IssueSlot,
    supersede: CancellationToken,
}

/// Delayed-task scheduler with one issuance slot per key.
pub struct Debouncer<K> {
    window: Duration,
    slots: Mutex<HashMap<K, Entry>>,
    next_generation: AtomicU64,
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Debug + Send,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Current state of `key`. Keys with no slot are Idle.
    pub fn state(&self, key: &K) -> IssueState {
        self.slots
            .lock()
            .get(key)
            .map(|e| e.slot.state())
            .unwrap_or(IssueState::Idle)
    }

    /// Schedule `op` for `key` after the debounce window.
    pub async fn run<F, Fut, T>(&self, key: K, op: F) -> Debounced<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some((generation, supersede)) = self.schedule(&key) else {
            trace!(?key, "debounce_coalesced");
            return Debounced::Coalesced;
        };
        let _guard = SlotGuard {
            debouncer: self,
            key: key.clone(),
            generation,
        };

        tokio::select! {
            _ = tokio::time::sleep(self.window) => {}
            _ = supersede.cancelled() => {
                trace!(?key, generation, "debounce_superseded");
                return Debounced::Superseded;
            }
        }

        if !self.begin(&key, generation) {
            return Debounced::Superseded;
        }
        debug!(?key, generation, "debounce_fired");
        Debounced::Completed(op().await)
    }

    /// Returns the generation and supersede token for the new request, or
    /// None when the key is already in flight.
    fn schedule(&self, key: &K) -> Option<(u64, CancellationToken)> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let mut slots = self.slots.lock();
        match slots.get_mut(key) {
            Some(entry) => {
                if entry.slot.state() == IssueState::InFlight {
                    return None;
                }
                entry.slot.transition(IssueState::Scheduled, generation).ok()?;
                entry.supersede.cancel();
                entry.supersede = token.clone();
            }
            None => {
                slots.insert(
                    key.clone(),
                    Entry {
                        slot: IssueSlot::scheduled(generation),
                        supersede: token.clone(),
                    },
                );
            }
        }
        Some((generation, token))
    }

    fn begin(&self, key: &K, generation: u64) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(key) {
            Some(entry) if entry.slot.owned_by(generation) => {
                entry.slot.transition(IssueState::InFlight, generation).is_ok()
            }
            _ => false,
        }
    }

    /// Release the slot if `generation` still owns it.
    fn release(&self, key: &K, generation: u64) {
        let mut slots = self.slots.lock();
        let Some(entry) = slots.get_mut(key) else {
            return;
        };
        if !entry.slot.owned_by(generation) {
            return;
        }
        if entry.slot.state() == IssueState::InFlight {
            let _ = entry.slot.transition(IssueState::Settled, generation);
        }
        let _ = entry.slot.transition(IssueState::Idle, generation);
        slots.remove(key);
    }
}

/// Returns the slot to Idle however the request ends, including when the
/// caller's future is dropped mid-window or mid-flight.
struct SlotGuard<'a, K>
where
    K: Eq + Hash + Clone + Debug + Send,
{
    debouncer: &'a Debouncer<K>,
    key: K,
    generation: u64,
}

impl<K> Drop for SlotGuard<'_, K>
where
    K: Eq + Hash + Clone + Debug + Send,
{
    fn drop(&mut self) {
        self.debouncer.release(&self.key, self.generation);
    }
}
