//! One-shot rendezvous barrier and the per-worker sub-total slots it guards.
//!
//! ```text
//!   worker 0 ──count──► publish(slot 0) ──┐
//!   worker 1 ──count──► publish(slot 1) ──┤
//!        ...                               ├──► Rendezvous::wait ──► Released
//!   worker n ──count──► publish(slot n) ──┤                             │
//!   coordinator ──────────────────────────┘                             ▼
//!                                                        Released::subtotals()
//! ```
//!
//! The slots belong to the barrier, and the only way to read them is
//! [`Released::subtotals`]. A [`Released`] token borrows the [`Rendezvous`]
//! that produced it and is only handed out once that barrier has released,
//! so a token from one barrier cannot open the slots of another.
//!
//! Unlike [`std::sync::Barrier`], a [`Rendezvous`] can shrink
//! ([`withdraw`](Rendezvous::withdraw)) when a worker fails to spawn, and can
//! be [poisoned](Rendezvous::poison) when a worker fails after spawning.
//! Poisoning releases every waiter with [`BarrierError::Poisoned`] instead of
//! leaving them blocked forever.

use std::fmt::{self, Debug};
use std::sync::OnceLock;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::table::CounterTable;

/// Why a rendezvous wait did not release normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BarrierError {
    /// A participant failed before arriving.
    #[error("barrier poisoned by a failed participant")]
    Poisoned,
}

/// Proof that a particular [`Rendezvous`] released normally.
pub struct Released<'a> {
    barrier: &'a Rendezvous,
}

impl<'a> Released<'a> {
    /// Reads every sub-total slot of the barrier that released.
    ///
    /// Slots of workers that never ran (failed spawn) are `None`.
    pub fn subtotals(&self) -> Vec<Option<&'a Subtotal>> {
        self.barrier.slots.read()
    }
}

impl Debug for Released<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Released({:?})", self.barrier.slots)
    }
}

#[derive(Debug)]
struct State {
    parties: usize,
    arrived: usize,
    released: bool,
    poisoned: bool,
}

/// A one-shot barrier for a fixed (but shrinkable) number of parties.
pub struct Rendezvous {
    state: Mutex<State>,
    cond: Condvar,
    slots: SubtotalSlots,
}

impl Rendezvous {
    /// Creates a barrier that releases once `parties` callers have arrived.
    pub fn new(parties: usize) -> Self {
        Self::with_slots(parties, 0)
    }

    /// Creates a barrier guarding `slots` sub-total slots.
    pub fn with_slots(parties: usize, slots: usize) -> Self {
        Self {
            state: Mutex::new(State {
                parties,
                arrived: 0,
                released: parties == 0,
                poisoned: false,
            }),
            cond: Condvar::new(),
            slots: SubtotalSlots::new(slots),
        }
    }

    /// The slots workers publish into before they wait.
    pub fn slots(&self) -> &SubtotalSlots {
        &self.slots
    }

    /// Blocks until every party has arrived, or the barrier is poisoned.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use bytetally::rendezvous::Rendezvous;
    /// use std::sync::Arc;
    /// use std::thread;
    ///
    /// let barrier = Arc::new(Rendezvous::new(2));
    /// let other = Arc::clone(&barrier);
    /// let handle = thread::spawn(move || other.wait().is_ok());
    /// assert!(barrier.wait().is_ok());
    /// assert!(handle.join().unwrap());
    /// ```
    pub fn wait(&self) -> Result<Released<'_>, BarrierError> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(BarrierError::Poisoned);
        }
        if state.released {
            return Ok(Released { barrier: self });
        }

        state.arrived += 1;
        if state.arrived >= state.parties {
            state.released = true;
            self.cond.notify_all();
            return Ok(Released { barrier: self });
        }

        while !state.released && !state.poisoned {
            self.cond.wait(&mut state);
        }
        if state.released {
            Ok(Released { barrier: self })
        } else {
            Err(BarrierError::Poisoned)
        }
    }

    /// Returns a token if the barrier has already released, without arriving.
    pub fn released(&self) -> Option<Released<'_>> {
        if self.state.lock().released {
            Some(Released { barrier: self })
        } else {
            None
        }
    }

    /// Removes one expected party that will never arrive.
    ///
    /// Releases the waiters if the remaining parties have all arrived.
    pub fn withdraw(&self) {
        let mut state = self.state.lock();
        if state.released || state.parties == 0 {
            return;
        }
        state.parties -= 1;
        if state.arrived >= state.parties {
            state.released = true;
            self.cond.notify_all();
        }
    }

    /// Fails the barrier: current and future waiters get [`BarrierError::Poisoned`].
    ///
    /// Has no effect once the barrier has released.
    pub fn poison(&self) {
        let mut state = self.state.lock();
        if !state.released {
            state.poisoned = true;
            self.cond.notify_all();
        }
    }

    /// Number of parties still expected in total.
    pub fn parties(&self) -> usize {
        self.state.lock().parties
    }

    /// Number of parties that have arrived.
    pub fn arrived(&self) -> usize {
        self.state.lock().arrived
    }

    /// Returns `true` once the barrier has released normally.
    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    /// Returns `true` if the barrier was poisoned before release.
    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }

    /// Returns a guard that poisons this barrier unless defused.
    ///
    /// Workers hold one while counting so that an early return or a panic
    /// releases everybody else instead of deadlocking them.
    pub fn arm(&self) -> PoisonGuard<'_> {
        PoisonGuard {
            barrier: self,
            armed: true,
        }
    }
}

impl Debug for Rendezvous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "Rendezvous{{ {}/{} released:{} poisoned:{} }}",
            state.arrived, state.parties, state.released, state.poisoned
        )
    }
}

/// Poisons a [`Rendezvous`] on drop unless [`defuse`](PoisonGuard::defuse)d.
#[must_use = "the guard poisons the barrier when dropped"]
pub struct PoisonGuard<'a> {
    barrier: &'a Rendezvous,
    armed: bool,
}

impl PoisonGuard<'_> {
    /// Disarms the guard.
    pub fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for PoisonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.barrier.poison();
        }
    }
}

/// A worker's private result, published once before the barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subtotal {
    /// The worker's private table.
    pub table: CounterTable,
    /// Bytes the worker counted.
    pub counted: u64,
    /// Sum of the values of the counted bytes.
    pub value_sum: u64,
}

/// One write-once slot per worker, owned by a [`Rendezvous`].
///
/// Slots are cache-line padded so workers publishing at the same time do
/// not share a line.
pub struct SubtotalSlots {
    slots: Box<[CachePadded<OnceLock<Subtotal>>]>,
}

impl SubtotalSlots {
    fn new(workers: usize) -> Self {
        Self {
            slots: (0..workers)
                .map(|_| CachePadded::new(OnceLock::new()))
                .collect(),
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if there are no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Writes the subtotal of worker `index`.
    ///
    /// Returns `false` if the index is out of range or the slot was already
    /// written; the first write wins.
    pub fn publish(&self, index: usize, subtotal: Subtotal) -> bool {
        match self.slots.get(index) {
            Some(slot) => slot.set(subtotal).is_ok(),
            None => false,
        }
    }

    fn read(&self) -> Vec<Option<&Subtotal>> {
        self.slots.iter().map(|slot| slot.get()).collect()
    }
}

impl Debug for SubtotalSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let written = self.slots.iter().filter(|s| s.get().is_some()).count();
        write!(f, "SubtotalSlots{{ {}/{} written }}", written, self.slots.len())
    }
}
