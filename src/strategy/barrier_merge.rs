//! Private tables, one barrier, one merge.
//!
//! Each worker thread counts into its own [`CounterTable`] without any
//! locking, publishes the result into its slot of the shared [`Rendezvous`]
//! and then waits on it. The coordinator is the extra party:
//! once its own wait returns, every slot has been written and it folds them
//! into the final table.
//!
//! A worker that fails before publishing poisons the barrier, which fails
//! the whole run. A worker that could not be started withdraws its party so
//! the others are not left waiting.

use std::io;
use std::sync::Arc;
use std::thread;

use log::{debug, info, warn};

use crate::error::{CountError, Result};
use crate::input::InputStream;
use crate::lifecycle::{ResourceKind, ResourceLedger, Tracked};
use crate::rendezvous::{Rendezvous, Subtotal};
use crate::strategy::{
    join_workers, Aggregate, Completion, StrategyKind, SyncStrategy, WorkerSubtotal, WorkerThread,
};
use crate::table::{CounterTable, KeyRange};
use crate::worker::{Increment, IncrementHook, WorkerDescriptor, WorkerSummary, WorkerUnit};

/// A worker's private table.
struct LocalTable {
    table: CounterTable,
    hook: Option<IncrementHook>,
}

impl Increment for LocalTable {
    #[inline]
    fn increment(&mut self, key: u8) -> Result<()> {
        self.table.increment(key);
        if let Some(hook) = &self.hook {
            hook(key);
        }
        Ok(())
    }
}

/// Thread workers with private tables merged after a barrier.
pub struct BarrierMergeStrategy {
    hook: Option<IncrementHook>,
    ledger: ResourceLedger,
    barrier: Option<Arc<Rendezvous>>,
    tracked: Option<Tracked>,
    workers: Vec<WorkerThread>,
}

impl BarrierMergeStrategy {
    /// Creates the strategy; the barrier is sized in [`SyncStrategy::setup`].
    pub fn new(hook: Option<IncrementHook>, ledger: ResourceLedger) -> Self {
        Self {
            hook,
            ledger,
            barrier: None,
            tracked: None,
            workers: Vec::new(),
        }
    }

    fn barrier(&self) -> Result<&Arc<Rendezvous>> {
        self.barrier.as_ref().ok_or_else(|| {
            CountError::sync("barrier lookup", io::Error::other("strategy not set up"))
        })
    }

    /// Gives up the barrier party of a worker that could not be started.
    pub(crate) fn abandon(&self, index: usize, source: io::Error) -> CountError {
        if let Some(barrier) = &self.barrier {
            barrier.withdraw();
            warn!("worker {} never started, barrier down to {} parties", index, barrier.parties());
        }
        CountError::Spawn { index, source }
    }
}

impl SyncStrategy for BarrierMergeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::BarrierMerge
    }

    fn setup(&mut self, workers: usize) -> Result<()> {
        self.barrier = Some(Arc::new(Rendezvous::with_slots(workers + 1, workers)));
        self.tracked = Some(self.ledger.track(ResourceKind::Barrier));
        info!("barrier ready for {} workers and the coordinator", workers);
        Ok(())
    }

    fn spawn(&mut self, worker: WorkerDescriptor, input: InputStream) -> Result<()> {
        let barrier = Arc::clone(self.barrier()?);
        let hook = self.hook.clone();
        let unit = WorkerUnit::new(worker.clone(), KeyRange::Full);
        let index = worker.index;

        let spawned = thread::Builder::new()
            .name(format!("tally-merge-{}", index))
            .spawn(move || -> Result<WorkerSummary> {
                let guard = barrier.arm();

                let mut local = LocalTable {
                    table: CounterTable::new(KeyRange::Full),
                    hook,
                };
                let summary = unit.run(input, &mut local)?;

                barrier.slots().publish(
                    index,
                    Subtotal {
                        table: local.table,
                        counted: summary.counted,
                        value_sum: summary.value_sum,
                    },
                );
                guard.defuse();

                barrier
                    .wait()
                    .map_err(|e| CountError::sync("barrier wait", io::Error::other(e)))?;
                Ok(summary)
            });

        match spawned {
            Ok(handle) => {
                debug!("{} started", worker);
                self.workers.push((worker, handle));
                Ok(())
            }
            Err(source) => Err(self.abandon(index, source)),
        }
    }

    fn await_completion(&mut self) -> Result<Completion> {
        let barrier = Arc::clone(self.barrier()?);
        let waited = barrier.wait().map(|_| ());
        let completion = join_workers(std::mem::take(&mut self.workers));

        match waited {
            Ok(()) => {
                info!("barrier released, {} workers done", completion.summaries.len());
                Ok(completion)
            }
            Err(e) => {
                // bystanders only report the poisoned wait; name the culprit
                let culprit = completion
                    .failures
                    .iter()
                    .find(|f| !f.reason.starts_with("barrier wait"))
                    .or_else(|| completion.failures.first());
                let reason = match culprit {
                    Some(failure) => {
                        format!("{} (worker {}: {})", e, failure.index, failure.reason)
                    }
                    None => e.to_string(),
                };
                warn!("barrier wait failed: {}", reason);
                Err(CountError::sync("barrier wait", io::Error::other(reason)))
            }
        }
    }

    fn aggregate(&mut self) -> Result<Aggregate> {
        let barrier = self.barrier()?;
        let released = barrier.released().ok_or_else(|| {
            CountError::sync("barrier merge", io::Error::other("barrier has not released"))
        })?;

        let mut table = CounterTable::new(KeyRange::Full);
        let mut subtotals = Vec::with_capacity(barrier.slots().len());
        for (index, slot) in released.subtotals().into_iter().enumerate() {
            if let Some(subtotal) = slot {
                table.merge(&subtotal.table);
                subtotals.push(WorkerSubtotal {
                    index,
                    counted: subtotal.counted,
                    value_sum: subtotal.value_sum,
                });
            }
        }
        debug!("merged {} sub-totals", subtotals.len());
        Ok(Aggregate { table, subtotals })
    }

    fn teardown(&mut self) {
        if let Some(barrier) = &self.barrier {
            // Nobody may stay parked on a barrier that is going away.
            barrier.poison();
        }
        if !self.workers.is_empty() {
            let _ = join_workers(std::mem::take(&mut self.workers));
        }
        self.barrier = None;
        if let Some(tracked) = self.tracked.take() {
            tracked.release();
            debug!("barrier released");
        }
    }
}

impl Drop for BarrierMergeStrategy {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn stream(bytes: &[u8]) -> InputStream {
        Box::new(Cursor::new(bytes.to_vec()))
    }

    fn start(strategy: &mut BarrierMergeStrategy, inputs: Vec<InputStream>) {
        strategy.setup(inputs.len()).unwrap();
        for (i, input) in inputs.into_iter().enumerate() {
            strategy
                .spawn(WorkerDescriptor::new(i, format!("in{i}")), input)
                .unwrap();
        }
    }

    #[test]
    fn test_merge_conserves_counts() {
        let mut strategy = BarrierMergeStrategy::new(None, ResourceLedger::new());
        start(
            &mut strategy,
            vec![stream(b"aabc"), stream(b"xyz\n"), stream(&[0, 255, 255])],
        );
        let completion = strategy.await_completion().unwrap();
        let aggregate = strategy.aggregate().unwrap();
        strategy.teardown();

        assert_eq!(completion.summaries.len(), 3);
        assert!(completion.failures.is_empty());
        assert_eq!(aggregate.table.total(), 11);
        assert_eq!(aggregate.table.get(b'a'), 2);
        assert_eq!(aggregate.table.get(b'\n'), 1);
        assert_eq!(aggregate.table.get(255), 2);
    }

    #[test]
    fn test_subtotals_per_worker() {
        let mut strategy = BarrierMergeStrategy::new(None, ResourceLedger::new());
        start(&mut strategy, vec![stream(b"ab"), stream(b"cccc")]);
        strategy.await_completion().unwrap();
        let aggregate = strategy.aggregate().unwrap();

        assert_eq!(
            aggregate.subtotals,
            vec![
                WorkerSubtotal {
                    index: 0,
                    counted: 2,
                    value_sum: u64::from(b'a') + u64::from(b'b'),
                },
                WorkerSubtotal {
                    index: 1,
                    counted: 4,
                    value_sum: 4 * u64::from(b'c'),
                },
            ]
        );
        let counted: u64 = aggregate.subtotals.iter().map(|s| s.counted).sum();
        assert_eq!(counted, aggregate.table.total());
    }

    #[test]
    fn test_isolation_during_counting() {
        // No worker may pass the barrier while another is still counting.
        let slow_left = Arc::new(AtomicUsize::new(5));
        let left = Arc::clone(&slow_left);
        let hook: IncrementHook = Arc::new(move |key| {
            if key == b's' {
                std::thread::sleep(Duration::from_millis(5));
                left.fetch_sub(1, Ordering::SeqCst);
            }
        });

        let mut strategy = BarrierMergeStrategy::new(Some(hook), ResourceLedger::new());
        start(&mut strategy, vec![stream(b"quick"), stream(b"sssss")]);

        // the fast worker is parked while the slow one counts
        while slow_left.load(Ordering::SeqCst) > 0 {
            assert!(!strategy.workers[0].1.is_finished());
            std::thread::sleep(Duration::from_millis(1));
        }
        // every worker has arrived, but the coordinator has not
        std::thread::sleep(Duration::from_millis(20));
        assert!(strategy.workers.iter().all(|(_, h)| !h.is_finished()));
        assert_eq!(strategy.barrier.as_ref().unwrap().arrived(), 2);

        let completion = strategy.await_completion().unwrap();
        assert_eq!(completion.summaries.len(), 2);
        let aggregate = strategy.aggregate().unwrap();
        assert_eq!(aggregate.table.get(b's'), 5);
        assert_eq!(aggregate.table.total(), 10);
    }

    #[test]
    fn test_unstarted_worker_withdraws() {
        let ledger = ResourceLedger::new();
        let mut strategy = BarrierMergeStrategy::new(None, ledger.clone());
        strategy.setup(3).unwrap();
        strategy
            .spawn(WorkerDescriptor::new(0, "in0"), stream(b"ab"))
            .unwrap();
        let err = strategy.abandon(1, io::Error::other("no threads left"));
        assert!(matches!(err, CountError::Spawn { index: 1, .. }));
        strategy
            .spawn(WorkerDescriptor::new(2, "in2"), stream(b"cde"))
            .unwrap();
        assert_eq!(strategy.barrier.as_ref().unwrap().parties(), 3);

        // two workers plus the coordinator release the barrier
        let completion = strategy.await_completion().unwrap();
        assert_eq!(completion.summaries.len(), 2);
        let aggregate = strategy.aggregate().unwrap();
        let indices: Vec<usize> = aggregate.subtotals.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(aggregate.table.total(), 5);

        strategy.teardown();
        assert!(ledger.is_balanced());
    }

    #[test]
    fn test_failed_worker_aborts_run() {
        let hook: IncrementHook = Arc::new(|key| {
            if key == b'!' {
                panic!("bad byte");
            }
        });
        let ledger = ResourceLedger::new();
        let mut strategy = BarrierMergeStrategy::new(Some(hook), ledger.clone());
        start(
            &mut strategy,
            vec![stream(b"aaaa"), stream(b"b!b"), stream(b"cccc")],
        );

        let err = strategy.await_completion().unwrap_err();
        assert!(matches!(err, CountError::Synchronization { op: "barrier wait", .. }));
        assert!(err.to_string().contains("barrier wait"));
        assert!(err.to_string().contains("worker 1: bad byte"), "{}", err);
        assert!(strategy.aggregate().is_err());

        strategy.teardown();
        assert!(ledger.is_balanced());
    }

    #[test]
    fn test_aggregate_requires_release() {
        let mut strategy = BarrierMergeStrategy::new(None, ResourceLedger::new());
        start(&mut strategy, vec![stream(b"a")]);
        assert!(strategy.aggregate().is_err());
        strategy.await_completion().unwrap();
        assert!(strategy.aggregate().is_ok());
    }

    #[test]
    fn test_teardown_without_waiting() {
        let ledger = ResourceLedger::new();
        let mut strategy = BarrierMergeStrategy::new(None, ledger.clone());
        start(&mut strategy, vec![stream(b"abc"), stream(b"def")]);
        // workers are parked on the barrier; teardown must still return
        strategy.teardown();
        assert_eq!(ledger.created(ResourceKind::Barrier), 1);
        assert!(ledger.is_balanced());
    }

    #[test]
    fn test_no_workers() {
        let mut strategy = BarrierMergeStrategy::new(None, ResourceLedger::new());
        strategy.setup(0).unwrap();
        strategy.await_completion().unwrap();
        let aggregate = strategy.aggregate().unwrap();
        assert!(aggregate.table.is_empty());
        assert!(aggregate.subtotals.is_empty());
    }
}
