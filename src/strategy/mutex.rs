//! One table, one lock, many threads.
//!
//! Every worker thread increments the same [`CounterTable`] through a single
//! [`parking_lot::Mutex`]. All updates are totally ordered, whatever their
//! key. A worker that fails (unreadable input, panic inside the critical
//! section) ends on its own; the guard is dropped during unwinding, so the
//! remaining workers keep counting and the run still succeeds.

use std::sync::Arc;
use std::thread;

use log::{debug, info};
use parking_lot::Mutex;

use crate::error::{CountError, Result};
use crate::input::InputStream;
use crate::lifecycle::{ResourceKind, ResourceLedger, Tracked};
use crate::strategy::{
    join_workers, Aggregate, Completion, StrategyKind, SyncStrategy, WorkerThread,
};
use crate::table::{CounterTable, KeyRange};
use crate::worker::{Increment, IncrementHook, WorkerDescriptor, WorkerUnit};

/// Worker-side handle: lock, update, unlock.
pub struct LockedTable<'a> {
    table: &'a Mutex<CounterTable>,
    hook: Option<&'a IncrementHook>,
}

impl<'a> LockedTable<'a> {
    /// Wraps a shared table.
    pub fn new(table: &'a Mutex<CounterTable>, hook: Option<&'a IncrementHook>) -> Self {
        Self { table, hook }
    }
}

impl Increment for LockedTable<'_> {
    #[inline]
    fn increment(&mut self, key: u8) -> Result<()> {
        let mut table = self.table.lock();
        table.increment(key);
        if let Some(hook) = self.hook {
            hook(key);
        }
        Ok(())
    }
}

/// Thread workers sharing one mutex-protected table.
pub struct MutexStrategy {
    hook: Option<IncrementHook>,
    ledger: ResourceLedger,
    table: Option<Arc<Mutex<CounterTable>>>,
    tracked: Option<Tracked>,
    workers: Vec<WorkerThread>,
}

impl MutexStrategy {
    /// Creates the strategy; nothing is allocated until [`SyncStrategy::setup`].
    pub fn new(hook: Option<IncrementHook>, ledger: ResourceLedger) -> Self {
        Self {
            hook,
            ledger,
            table: None,
            tracked: None,
            workers: Vec::new(),
        }
    }

    fn shared_table(&self) -> Result<&Arc<Mutex<CounterTable>>> {
        self.table.as_ref().ok_or_else(|| {
            CountError::sync("mutex lookup", std::io::Error::other("strategy not set up"))
        })
    }
}

impl SyncStrategy for MutexStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Mutex
    }

    fn setup(&mut self, workers: usize) -> Result<()> {
        self.table = Some(Arc::new(Mutex::new(CounterTable::new(KeyRange::Full))));
        self.tracked = Some(self.ledger.track(ResourceKind::CounterMutex));
        info!("shared table ready for {} worker threads", workers);
        Ok(())
    }

    fn spawn(&mut self, worker: WorkerDescriptor, input: InputStream) -> Result<()> {
        let table = Arc::clone(self.shared_table()?);
        let hook = self.hook.clone();
        let unit = WorkerUnit::new(worker.clone(), KeyRange::Full);
        let index = worker.index;

        let handle = thread::Builder::new()
            .name(format!("tally-mutex-{}", index))
            .spawn(move || {
                let mut sink = LockedTable::new(&table, hook.as_ref());
                unit.run(input, &mut sink)
            })
            .map_err(|source| CountError::Spawn { index, source })?;

        debug!("{} started", worker);
        self.workers.push((worker, handle));
        Ok(())
    }

    fn await_completion(&mut self) -> Result<Completion> {
        let completion = join_workers(std::mem::take(&mut self.workers));
        info!(
            "{} workers finished, {} failed",
            completion.summaries.len(),
            completion.failures.len()
        );
        Ok(completion)
    }

    fn aggregate(&mut self) -> Result<Aggregate> {
        let table = self.shared_table()?.lock().clone();
        Ok(Aggregate {
            table,
            subtotals: Vec::new(),
        })
    }

    fn teardown(&mut self) {
        if !self.workers.is_empty() {
            // Joining is the only way to be sure no thread still holds the table.
            let _ = join_workers(std::mem::take(&mut self.workers));
        }
        self.table = None;
        if let Some(tracked) = self.tracked.take() {
            tracked.release();
            debug!("shared table released");
        }
    }
}

impl Drop for MutexStrategy {
    fn drop(&mut self) {
        self.teardown();
    }
}
