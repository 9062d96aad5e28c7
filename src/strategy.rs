//! Synchronization strategies.
//!
//! Every strategy answers the same question, "how does a worker safely add
//! one occurrence of key k", and owns the matching lifecycle: which shared
//! resources exist, how workers are started, and how the coordinator learns
//! that they are done.
//!
//! | Strategy | Workers | Shared state | Completion | Worker failure |
//! |----------|---------|--------------|------------|----------------|
//! | [`KeyedSemaphoreStrategy`] | processes | shared segment + one semaphore per key | `waitpid` | aborts the run |
//! | [`MutexStrategy`] | threads | one table behind one mutex | `join` | ends that worker |
//! | [`BarrierMergeStrategy`] | threads | one write-once slot per worker | rendezvous barrier | aborts the run |
//!
//! The coordinator drives a strategy through the [`SyncStrategy`] trait:
//!
//! ```text
//!   setup(n) ──► spawn(w0) .. spawn(wn) ──► await_completion() ──► aggregate() ──► teardown()
//! ```
//!
//! Workers see only the strategy's [`Increment`](crate::worker::Increment)
//! sink.

mod barrier_merge;
mod keyed_semaphore;
mod mutex;

pub use barrier_merge::BarrierMergeStrategy;
pub use keyed_semaphore::KeyedSemaphoreStrategy;
pub use mutex::MutexStrategy;

use std::any::Any;
use std::fmt;
use std::thread::JoinHandle;

use log::warn;

use crate::config::RunConfig;
use crate::error::Result;
use crate::input::InputStream;
use crate::table::{CounterTable, KeyRange};
use crate::worker::{WorkerDescriptor, WorkerFailure, WorkerSummary};

/// Selects one of the three strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum StrategyKind {
    /// Worker processes, shared segment, one semaphore per key.
    KeyedSemaphore,
    /// Worker threads, one shared table behind one mutex.
    #[default]
    Mutex,
    /// Worker threads with private tables merged after a barrier.
    BarrierMerge,
}

impl StrategyKind {
    /// All strategies.
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::KeyedSemaphore,
        StrategyKind::Mutex,
        StrategyKind::BarrierMerge,
    ];

    /// Short name used in logs and reports.
    pub const fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::KeyedSemaphore => "keyed-semaphore",
            StrategyKind::Mutex => "mutex",
            StrategyKind::BarrierMerge => "barrier-merge",
        }
    }

    /// The keys this strategy counts.
    ///
    /// The keyed-semaphore strategy keeps one semaphore per key and counts
    /// bytes 0 through 126 only; the thread strategies count every byte.
    pub const fn key_range(&self) -> KeyRange {
        match self {
            StrategyKind::KeyedSemaphore => KeyRange::Ascii,
            StrategyKind::Mutex | StrategyKind::BarrierMerge => KeyRange::Full,
        }
    }

    /// Returns `true` if a failing worker aborts the whole run.
    pub const fn aborts_on_worker_failure(&self) -> bool {
        !matches!(self, StrategyKind::Mutex)
    }

    /// Instantiates the strategy with the hook and ledger from `config`.
    pub fn build(&self, config: &RunConfig) -> Box<dyn SyncStrategy> {
        let hook = config.hook().cloned();
        let ledger = config.ledger().clone();
        match self {
            StrategyKind::KeyedSemaphore => Box::new(KeyedSemaphoreStrategy::new(hook, ledger)),
            StrategyKind::Mutex => Box::new(MutexStrategy::new(hook, ledger)),
            StrategyKind::BarrierMerge => Box::new(BarrierMergeStrategy::new(hook, ledger)),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the coordinator learns once all workers are done.
#[derive(Debug, Default)]
pub struct Completion {
    /// Workers that reached end of stream, in index order.
    pub summaries: Vec<WorkerSummary>,
    /// Workers that stopped early without aborting the run.
    pub failures: Vec<WorkerFailure>,
}

/// A per-worker total published before the barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkerSubtotal {
    /// Worker index.
    pub index: usize,
    /// Bytes the worker counted.
    pub counted: u64,
    /// Sum of the values of those bytes.
    pub value_sum: u64,
}

/// The final counts.
#[derive(Debug)]
pub struct Aggregate {
    /// The merged or shared table.
    pub table: CounterTable,
    /// Per-worker totals; only the barrier strategy fills these.
    pub subtotals: Vec<WorkerSubtotal>,
}

/// A synchronization discipline together with its resource lifecycle.
///
/// Calls arrive in the order `setup`, `spawn` (once per worker),
/// `await_completion`, `aggregate`, `teardown`. `teardown` may also arrive
/// at any earlier point after a fatal error and must be idempotent.
pub trait SyncStrategy: Send {
    /// Which strategy this is.
    fn kind(&self) -> StrategyKind;

    /// The keys workers must filter to before incrementing.
    fn key_range(&self) -> KeyRange {
        self.kind().key_range()
    }

    /// Allocates shared resources for `workers` workers.
    fn setup(&mut self, workers: usize) -> Result<()>;

    /// Starts one worker reading `input`.
    ///
    /// A [`CountError::Spawn`](crate::error::CountError::Spawn) result means
    /// the worker never ran; the strategy has already adjusted for its
    /// absence and the run may continue.
    fn spawn(&mut self, worker: WorkerDescriptor, input: InputStream) -> Result<()>;

    /// Blocks until every spawned worker is done.
    fn await_completion(&mut self) -> Result<Completion>;

    /// Reads the final table. Only valid after `await_completion` succeeded.
    fn aggregate(&mut self) -> Result<Aggregate>;

    /// Releases every shared resource.
    fn teardown(&mut self);
}

type WorkerThread = (WorkerDescriptor, JoinHandle<Result<WorkerSummary>>);

/// Joins worker threads, sorting outcomes into summaries and failures.
pub(crate) fn join_workers(handles: Vec<WorkerThread>) -> Completion {
    let mut completion = Completion::default();
    for (descriptor, handle) in handles {
        match handle.join() {
            Ok(Ok(summary)) => completion.summaries.push(summary),
            Ok(Err(e)) => {
                warn!("{} stopped: {}", descriptor, e);
                completion.failures.push(WorkerFailure::new(&descriptor, e));
            }
            Err(payload) => {
                let reason = panic_message(&*payload);
                warn!("{} panicked: {}", descriptor, reason);
                completion.failures.push(WorkerFailure::new(&descriptor, reason));
            }
        }
    }
    completion.summaries.sort_by_key(|s| s.index);
    completion
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ranges() {
        assert_eq!(StrategyKind::KeyedSemaphore.key_range(), KeyRange::Ascii);
        assert_eq!(StrategyKind::Mutex.key_range(), KeyRange::Full);
        assert_eq!(StrategyKind::BarrierMerge.key_range(), KeyRange::Full);
    }

    #[test]
    fn test_failure_policy_asymmetry() {
        assert!(StrategyKind::KeyedSemaphore.aborts_on_worker_failure());
        assert!(StrategyKind::BarrierMerge.aborts_on_worker_failure());
        assert!(!StrategyKind::Mutex.aborts_on_worker_failure());
    }

    #[test]
    fn test_build_matches_kind() {
        for kind in StrategyKind::ALL {
            let strategy = kind.build(&RunConfig::new(kind));
            assert_eq!(strategy.kind(), kind);
            assert_eq!(strategy.key_range(), kind.key_range());
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(StrategyKind::BarrierMerge.to_string(), "barrier-merge");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u32);
        assert_eq!(panic_message(&*payload), "worker panicked");
    }

    #[test]
    fn test_join_workers_sorts_and_splits() {
        use crate::error::CountError;
        use std::io;
        use std::thread;

        let ok = |index: usize| WorkerSummary {
            index,
            source: format!("in{index}"),
            ..Default::default()
        };
        let handles: Vec<WorkerThread> = vec![
            (
                WorkerDescriptor::new(2, "in2"),
                thread::spawn(move || -> Result<WorkerSummary> { Ok(ok(2)) }),
            ),
            (
                WorkerDescriptor::new(1, "in1"),
                thread::spawn(|| -> Result<WorkerSummary> {
                    Err(CountError::sync("lock", io::Error::other("no")))
                }),
            ),
            (
                WorkerDescriptor::new(0, "in0"),
                thread::spawn(move || -> Result<WorkerSummary> { Ok(ok(0)) }),
            ),
        ];
        let completion = join_workers(handles);
        let indices: Vec<_> = completion.summaries.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(completion.failures.len(), 1);
        assert_eq!(completion.failures[0].index, 1);
    }
}
