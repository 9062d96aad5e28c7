//! Bookkeeping for shared resources.
//!
//! Every shared resource a strategy allocates (the shared segment, the
//! semaphore set, the counter mutex, the barrier) is registered in a
//! [`ResourceLedger`] through a [`Tracked`] handle. Dropping or releasing the
//! handle records exactly one release, so the ledger balances on the success
//! path and on every error path that unwinds the owning value.
//!
//! The ledger is cheap to clone and is shared with the caller through
//! [`RunConfig::with_ledger`](crate::config::RunConfig::with_ledger), which
//! lets tests check that a failed run leaked nothing.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::trace;

/// Kinds of resource a run may allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Anonymous shared mapping holding the cross-process counter table.
    SharedSegment,
    /// System V semaphore set, one semaphore per key.
    SemaphoreSet,
    /// The coarse lock around the shared in-process table.
    CounterMutex,
    /// The rendezvous barrier used to merge per-worker tables.
    Barrier,
}

impl ResourceKind {
    /// All kinds, in ledger order.
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::SharedSegment,
        ResourceKind::SemaphoreSet,
        ResourceKind::CounterMutex,
        ResourceKind::Barrier,
    ];

    const fn slot(self) -> usize {
        match self {
            ResourceKind::SharedSegment => 0,
            ResourceKind::SemaphoreSet => 1,
            ResourceKind::CounterMutex => 2,
            ResourceKind::Barrier => 3,
        }
    }

    /// Human readable name.
    pub const fn as_str(self) -> &'static str {
        match self {
            ResourceKind::SharedSegment => "shared segment",
            ResourceKind::SemaphoreSet => "semaphore set",
            ResourceKind::CounterMutex => "counter mutex",
            ResourceKind::Barrier => "barrier",
        }
    }
}

#[derive(Default)]
struct Counts {
    created: [AtomicUsize; 4],
    released: [AtomicUsize; 4],
}

/// Shared record of resource creations and releases.
///
/// # Examples
///
/// ```rust
/// use bytetally::lifecycle::{ResourceKind, ResourceLedger};
///
/// let ledger = ResourceLedger::new();
/// let handle = ledger.track(ResourceKind::Barrier);
/// assert_eq!(ledger.outstanding(), 1);
/// handle.release();
/// assert!(ledger.is_balanced());
/// ```
#[derive(Clone, Default)]
pub struct ResourceLedger {
    counts: Arc<Counts>,
}

impl ResourceLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the creation of a resource and returns its release handle.
    pub fn track(&self, kind: ResourceKind) -> Tracked {
        self.counts.created[kind.slot()].fetch_add(1, Ordering::AcqRel);
        trace!("{} created", kind.as_str());
        Tracked {
            ledger: self.clone(),
            kind,
            released: false,
        }
    }

    /// How many resources of `kind` were created.
    pub fn created(&self, kind: ResourceKind) -> usize {
        self.counts.created[kind.slot()].load(Ordering::Acquire)
    }

    /// How many resources of `kind` were released.
    pub fn released(&self, kind: ResourceKind) -> usize {
        self.counts.released[kind.slot()].load(Ordering::Acquire)
    }

    /// Resources created but not yet released, over all kinds.
    pub fn outstanding(&self) -> usize {
        ResourceKind::ALL
            .iter()
            .map(|k| self.created(*k) - self.released(*k))
            .sum()
    }

    /// Returns `true` if every creation has been matched by one release.
    pub fn is_balanced(&self) -> bool {
        ResourceKind::ALL
            .iter()
            .all(|k| self.created(*k) == self.released(*k))
    }

    fn record_release(&self, kind: ResourceKind) {
        self.counts.released[kind.slot()].fetch_add(1, Ordering::AcqRel);
        trace!("{} released", kind.as_str());
    }
}

impl Debug for ResourceLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceLedger{{")?;
        for kind in ResourceKind::ALL {
            write!(
                f,
                " {}:{}/{}",
                kind.as_str(),
                self.released(kind),
                self.created(kind)
            )?;
        }
        write!(f, " }}")
    }
}

/// Release handle for one tracked resource.
///
/// The release is recorded once, either by [`Tracked::release`] or on drop.
#[must_use = "dropping the handle records the release immediately"]
pub struct Tracked {
    ledger: ResourceLedger,
    kind: ResourceKind,
    released: bool,
}

impl Tracked {
    /// The kind of resource this handle tracks.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Records the release now.
    pub fn release(mut self) {
        self.mark_released();
    }

    /// Gives the handle up without recording a release.
    ///
    /// For resources whose removal failed: the ledger keeps counting them
    /// as outstanding.
    pub fn leak(mut self) {
        self.released = true;
    }

    fn mark_released(&mut self) {
        if !self.released {
            self.released = true;
            self.ledger.record_release(self.kind);
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.mark_released();
    }
}

impl Debug for Tracked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tracked({}, released: {})", self.kind.as_str(), self.released)
    }
}
