//! Cross-process primitives for the keyed-semaphore strategy.
//!
//! - [`SharedSegment`]: an anonymous `MAP_SHARED` mapping holding the counter
//!   table and one progress record per worker. Forked workers inherit the
//!   mapping, so every process sees the same memory.
//! - [`SemaphoreSet`]: a System V semaphore set with one binary semaphore
//!   per key, each initialised to 1.
//!
//! Both are owned by the coordinator process and removed on drop. Forked
//! workers hold bitwise copies but leave through `_exit`, so the removal
//! runs exactly once, in the coordinator.
//!
//! ```text
//!   SharedSegment
//!   ┌──────────────────────────────┬──────────────────────────────────┐
//!   │ counters[256]  (AtomicU64)   │ workers[MAX_WORKERS] (tallies)   │
//!   └──────────────────────────────┴──────────────────────────────────┘
//!          ▲ guarded by semaphore k        ▲ written by its owner only
//! ```

use std::fmt::{self, Debug};
use std::io;
use std::mem;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::config::MAX_WORKERS;
use crate::error::{CountError, Result};
use crate::lifecycle::{ResourceKind, ResourceLedger, Tracked};
use crate::table::{CounterTable, KeyRange, BYTE_KEYS};
use crate::worker::WorkerSummary;

/// Permission bits of the semaphore set.
const SEM_PERM: libc::c_int = 0o600;

/// Per-worker progress written by the worker process at end of stream.
#[repr(C)]
struct WorkerTally {
    counted: AtomicU64,
    skipped: AtomicU64,
    value_sum: AtomicU64,
}

#[repr(C)]
struct SegmentLayout {
    counters: [AtomicU64; BYTE_KEYS],
    workers: [WorkerTally; MAX_WORKERS],
}

/// Counter table living in memory shared between processes.
///
/// Slots are atomics only so that cross-process access is defined; an
/// increment is a plain load followed by a store, and mutual exclusion per
/// key comes from the [`SemaphoreSet`].
pub struct SharedSegment {
    base: NonNull<SegmentLayout>,
    range: KeyRange,
    tracked: Option<Tracked>,
}

// The mapping is only accessed through atomics.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Maps a zeroed shared segment for a table over `range`.
    pub fn create(range: KeyRange, ledger: &ResourceLedger) -> Result<Self> {
        let len = NonZeroUsize::new(mem::size_of::<SegmentLayout>())
            .ok_or_else(|| CountError::resource("shared segment", Errno::EINVAL))?;

        // SAFETY: fresh anonymous mapping, no existing memory is aliased.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|e| CountError::resource("shared segment", e))?;

        let segment = Self {
            base: ptr.cast(),
            range,
            tracked: Some(ledger.track(ResourceKind::SharedSegment)),
        };
        info!(
            "shared segment mapped: {} bytes at {:p}, {} counters",
            len,
            segment.base,
            range.width()
        );
        Ok(segment)
    }

    fn layout(&self) -> &SegmentLayout {
        // SAFETY: the mapping lives as long as `self` and is zero-initialised
        // by the kernel, which is a valid bit pattern for every field.
        unsafe { self.base.as_ref() }
    }

    /// The key range of the table.
    pub fn range(&self) -> KeyRange {
        self.range
    }

    /// Adds one to `key` as an unsynchronized load and store.
    ///
    /// Callers must hold the semaphore for `key`.
    #[inline]
    pub fn bump(&self, key: u8) -> u64 {
        let slot = &self.layout().counters[key as usize];
        let next = slot.load(Ordering::Relaxed) + 1;
        slot.store(next, Ordering::Relaxed);
        next
    }

    /// Current value of `key`.
    pub fn get(&self, key: u8) -> u64 {
        self.layout().counters[key as usize].load(Ordering::Relaxed)
    }

    /// Records a worker's final progress. Each worker writes only its own record.
    pub fn record_worker(&self, summary: &WorkerSummary) {
        if let Some(tally) = self.layout().workers.get(summary.index) {
            tally.counted.store(summary.counted, Ordering::Relaxed);
            tally.skipped.store(summary.skipped, Ordering::Relaxed);
            tally.value_sum.store(summary.value_sum, Ordering::Relaxed);
        }
    }

    /// Reads back the progress of worker `index`.
    pub fn worker_summary(&self, index: usize, source: &str) -> WorkerSummary {
        let (counted, skipped, value_sum) = match self.layout().workers.get(index) {
            Some(t) => (
                t.counted.load(Ordering::Relaxed),
                t.skipped.load(Ordering::Relaxed),
                t.value_sum.load(Ordering::Relaxed),
            ),
            None => (0, 0, 0),
        };
        WorkerSummary {
            index,
            source: source.to_string(),
            counted,
            skipped,
            value_sum,
        }
    }

    /// Copies the shared counters into a private table.
    ///
    /// Only call once no worker process can still be running.
    pub fn snapshot(&self) -> CounterTable {
        let counts: Vec<u64> = self.layout().counters[..self.range.width()]
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .collect();
        CounterTable::from_counts(self.range, &counts)
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: `base` came from `mmap_anonymous` with this exact length and
        // no reference into the mapping outlives `self`.
        let res = unsafe { munmap(self.base.cast(), mem::size_of::<SegmentLayout>()) };
        let Some(tracked) = self.tracked.take() else {
            return;
        };
        match res {
            Ok(()) => {
                tracked.release();
                debug!("shared segment unmapped");
            }
            Err(e) => {
                tracked.leak();
                error!("unmapping shared segment failed, mapping leaked: {}", e);
            }
        }
    }
}

impl Debug for SharedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSegment({:p}, {:?})", self.base, self.range)
    }
}

/// A System V semaphore set, one binary semaphore per key.
pub struct SemaphoreSet {
    id: libc::c_int,
    len: usize,
    tracked: Option<Tracked>,
}

impl SemaphoreSet {
    /// Creates a private set of `len` semaphores, each set to 1.
    ///
    /// If initialisation fails part-way the set is removed before returning.
    pub fn create(len: usize, ledger: &ResourceLedger) -> Result<Self> {
        let nsems = libc::c_int::try_from(len)
            .map_err(|_| CountError::resource("semaphore set", Errno::EINVAL))?;

        // SAFETY: plain syscall, no pointers involved.
        let id = unsafe { libc::semget(libc::IPC_PRIVATE, nsems, libc::IPC_CREAT | SEM_PERM) };
        if id < 0 {
            return Err(CountError::resource("semaphore set", io::Error::last_os_error()));
        }

        // From here on, drop removes the set.
        let set = Self {
            id,
            len,
            tracked: Some(ledger.track(ResourceKind::SemaphoreSet)),
        };

        for num in 0..nsems {
            // SAFETY: SETVAL takes an int-sized union argument.
            let rc = unsafe { libc::semctl(id, num, libc::SETVAL, 1 as libc::c_int) };
            if rc < 0 {
                let source = io::Error::last_os_error();
                warn!("initialising semaphore {} of set {} failed: {}", num, id, source);
                return Err(CountError::resource("semaphore set", source));
            }
        }

        info!("semaphore set created: id={} semaphores={}", id, len);
        Ok(set)
    }

    /// The kernel identifier of the set.
    pub fn id(&self) -> libc::c_int {
        self.id
    }

    /// Number of semaphores in the set.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the set holds no semaphores.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Blocks until semaphore `num` is acquired.
    ///
    /// The operation carries `SEM_UNDO`, so the kernel gives the semaphore
    /// back if the calling process dies while holding it.
    pub fn acquire(&self, num: usize) -> Result<()> {
        self.op(num, -1).map_err(|e| CountError::sync("semaphore acquire", e))
    }

    /// Releases semaphore `num`.
    pub fn release(&self, num: usize) -> Result<()> {
        self.op(num, 1).map_err(|e| CountError::sync("semaphore release", e))
    }

    /// Current value of semaphore `num`: 1 when free, 0 when held.
    pub fn value(&self, num: usize) -> Result<i32> {
        let num = libc::c_int::try_from(num)
            .map_err(|_| CountError::sync("semaphore read", Errno::EINVAL))?;
        // SAFETY: GETVAL takes no argument.
        let rc = unsafe { libc::semctl(self.id, num, libc::GETVAL) };
        if rc < 0 {
            return Err(CountError::sync("semaphore read", io::Error::last_os_error()));
        }
        Ok(rc)
    }

    fn op(&self, num: usize, delta: libc::c_short) -> io::Result<()> {
        let sem_num = u16::try_from(num)
            .ok()
            .filter(|n| (*n as usize) < self.len)
            .ok_or_else(|| io::Error::from(Errno::EINVAL))?;
        let mut buf = libc::sembuf {
            sem_num,
            sem_op: delta,
            sem_flg: libc::SEM_UNDO as libc::c_short,
        };
        loop {
            // SAFETY: `buf` is a valid sembuf for the duration of the call.
            let rc = unsafe { libc::semop(self.id, &mut buf, 1) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }
}

impl Drop for SemaphoreSet {
    fn drop(&mut self) {
        // SAFETY: IPC_RMID takes no argument.
        let rc = unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        let err = (rc < 0).then(io::Error::last_os_error);
        let Some(tracked) = self.tracked.take() else {
            return;
        };
        match err {
            Some(err) => {
                tracked.leak();
                error!("removing semaphore set {} failed, set leaked: {}", self.id, err);
            }
            None => {
                tracked.release();
                debug!("semaphore set {} removed", self.id);
            }
        }
    }
}

impl Debug for SemaphoreSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SemaphoreSet{{ id:{} len:{} }}", self.id, self.len)
    }
}
