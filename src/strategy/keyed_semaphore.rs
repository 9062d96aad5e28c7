//! Worker processes over a shared segment, one semaphore per key.
//!
//! ```text
//!          coordinator
//!   ┌──────────┴───────────────────────────────┐
//!   │ SharedSegment (MAP_SHARED)  SemaphoreSet │
//!   └──────┬──────────────┬──────────────┬─────┘
//!       fork()         fork()         fork()
//!     worker 0        worker 1        worker n
//!   P(k) bump(k) V(k) for every admitted byte k
//! ```
//!
//! Workers are forked children. They inherit the mapping and the semaphore
//! set id, count their stream, write their own progress record and leave
//! through `_exit` so nothing owned by the coordinator is dropped twice.
//!
//! The coordinator polls its children with `waitpid(WNOHANG)`. The first
//! child that exits with a non-zero status, or is killed by a signal, aborts
//! the run: every other child is killed and reaped before the error is
//! returned.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;

use crossbeam_utils::Backoff;
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::{CountError, Result};
use crate::input::InputStream;
use crate::ipc::{SemaphoreSet, SharedSegment};
use crate::lifecycle::ResourceLedger;
use crate::strategy::{Aggregate, Completion, StrategyKind, SyncStrategy};
use crate::table::KeyRange;
use crate::worker::{Increment, IncrementHook, WorkerDescriptor, WorkerUnit};

const RANGE: KeyRange = KeyRange::Ascii;

/// Child exit statuses.
const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_SYNC: i32 = 3;
const EXIT_INPUT: i32 = 4;
const EXIT_PANIC: i32 = 5;

/// Pause between polling rounds once spinning is over.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Worker-side handle: P(k), load and store, hook, V(k).
pub struct KeyedIncrement<'a> {
    segment: &'a SharedSegment,
    semaphores: &'a SemaphoreSet,
    hook: Option<&'a IncrementHook>,
}

impl<'a> KeyedIncrement<'a> {
    /// Binds a segment to the semaphores that guard it.
    pub fn new(
        segment: &'a SharedSegment,
        semaphores: &'a SemaphoreSet,
        hook: Option<&'a IncrementHook>,
    ) -> Self {
        Self {
            segment,
            semaphores,
            hook,
        }
    }
}

impl Increment for KeyedIncrement<'_> {
    fn increment(&mut self, key: u8) -> Result<()> {
        let num = usize::from(key);
        self.semaphores.acquire(num)?;
        self.segment.bump(key);
        if let Some(hook) = self.hook {
            hook(key);
        }
        self.semaphores.release(num)
    }
}

#[derive(Debug)]
struct Child {
    descriptor: WorkerDescriptor,
    pid: Pid,
}

/// Forked workers sharing a segment guarded by per-key semaphores.
pub struct KeyedSemaphoreStrategy {
    hook: Option<IncrementHook>,
    ledger: ResourceLedger,
    segment: Option<SharedSegment>,
    semaphores: Option<SemaphoreSet>,
    children: Vec<Child>,
    finished: Vec<WorkerDescriptor>,
}

impl KeyedSemaphoreStrategy {
    /// Creates the strategy; the segment and semaphores come in [`SyncStrategy::setup`].
    pub fn new(hook: Option<IncrementHook>, ledger: ResourceLedger) -> Self {
        Self {
            hook,
            ledger,
            segment: None,
            semaphores: None,
            children: Vec::new(),
            finished: Vec::new(),
        }
    }

    fn resources(&self) -> Result<(&SharedSegment, &SemaphoreSet)> {
        match (&self.segment, &self.semaphores) {
            (Some(segment), Some(semaphores)) => Ok((segment, semaphores)),
            _ => Err(CountError::sync(
                "segment lookup",
                std::io::Error::other("strategy not set up"),
            )),
        }
    }

    /// Kills and reaps every child still running.
    fn abort_children(&mut self) {
        for child in self.children.drain(..) {
            match kill(child.pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("cannot kill {} (pid {}): {}", child.descriptor, child.pid, e),
            }
            reap(child.pid);
            debug!("{} (pid {}) killed", child.descriptor, child.pid);
        }
    }
}

/// Blocks until `pid` is gone.
fn reap(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return,
            Ok(_) => continue,
            Err(_) => return,
        }
    }
}

fn exit_code(err: &CountError) -> i32 {
    match err {
        CountError::Synchronization { .. } => EXIT_SYNC,
        CountError::Input { .. } | CountError::InputMissing { .. } => EXIT_INPUT,
        _ => EXIT_FAILURE,
    }
}

fn describe_exit(code: i32) -> String {
    let cause = match code {
        EXIT_SYNC => "semaphore failure",
        EXIT_INPUT => "input error",
        EXIT_PANIC => "panicked",
        _ => "failed",
    };
    format!("exited with status {} ({})", code, cause)
}

/// Body of a forked worker. Returns the exit status.
fn run_child(unit: &WorkerUnit, input: InputStream, sink: &mut KeyedIncrement<'_>) -> i32 {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| unit.run(input, &mut *sink)));
    match outcome {
        Ok(Ok(summary)) => {
            sink.segment.record_worker(&summary);
            EXIT_OK
        }
        Ok(Err(e)) => exit_code(&e),
        Err(_) => EXIT_PANIC,
    }
}

impl SyncStrategy for KeyedSemaphoreStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::KeyedSemaphore
    }

    fn setup(&mut self, workers: usize) -> Result<()> {
        let segment = SharedSegment::create(RANGE, &self.ledger)?;
        // on failure the segment is dropped here and unmapped
        let semaphores = SemaphoreSet::create(RANGE.width(), &self.ledger)?;
        self.segment = Some(segment);
        self.semaphores = Some(semaphores);
        info!("ready to fork {} worker processes", workers);
        Ok(())
    }

    fn spawn(&mut self, worker: WorkerDescriptor, input: InputStream) -> Result<()> {
        let (segment, semaphores) = self.resources()?;
        let unit = WorkerUnit::new(worker.clone(), RANGE);
        let index = worker.index;

        // SAFETY: the child runs only the counting loop over memory it
        // inherited and leaves through `_exit` without running destructors.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let mut sink = KeyedIncrement::new(segment, semaphores, self.hook.as_ref());
                let code = run_child(&unit, input, &mut sink);
                // SAFETY: terminates the child immediately.
                unsafe { libc::_exit(code) }
            }
            Ok(ForkResult::Parent { child }) => {
                debug!("{} forked as pid {}", worker, child);
                self.children.push(Child {
                    descriptor: worker,
                    pid: child,
                });
                Ok(())
            }
            Err(e) => Err(CountError::Spawn {
                index,
                source: e.into(),
            }),
        }
    }

    fn await_completion(&mut self) -> Result<Completion> {
        let backoff = Backoff::new();

        while !self.children.is_empty() {
            let mut progressed = false;
            let mut i = 0;
            while i < self.children.len() {
                let pid = self.children[i].pid;
                let failure = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::Exited(_, EXIT_OK)) => None,
                    Ok(WaitStatus::Exited(_, code)) => Some(describe_exit(code)),
                    Ok(WaitStatus::Signaled(_, signal, _)) => {
                        Some(format!("killed by {}", signal))
                    }
                    Ok(_) | Err(Errno::EINTR) => {
                        i += 1;
                        continue;
                    }
                    Err(e) => Some(format!("lost track of worker process: {}", e)),
                };

                let child = self.children.swap_remove(i);
                progressed = true;
                match failure {
                    None => {
                        debug!("{} (pid {}) finished", child.descriptor, pid);
                        self.finished.push(child.descriptor);
                    }
                    Some(reason) => {
                        error!("{} (pid {}) {}, aborting run", child.descriptor, pid, reason);
                        self.abort_children();
                        return Err(CountError::WorkerAborted {
                            index: child.descriptor.index,
                            reason,
                        });
                    }
                }
            }

            if progressed {
                backoff.reset();
            } else if backoff.is_completed() {
                thread::sleep(POLL_INTERVAL);
            } else {
                backoff.snooze();
            }
        }

        let finished = std::mem::take(&mut self.finished);
        let (segment, _) = self.resources()?;
        let mut summaries: Vec<_> = finished
            .iter()
            .map(|d| segment.worker_summary(d.index, &d.source))
            .collect();
        summaries.sort_by_key(|s| s.index);
        info!("{} worker processes exited cleanly", summaries.len());

        Ok(Completion {
            summaries,
            failures: Vec::new(),
        })
    }

    fn aggregate(&mut self) -> Result<Aggregate> {
        let (segment, _) = self.resources()?;
        Ok(Aggregate {
            table: segment.snapshot(),
            subtotals: Vec::new(),
        })
    }

    fn teardown(&mut self) {
        if !self.children.is_empty() {
            warn!("killing {} leftover worker processes", self.children.len());
            self.abort_children();
        }
        self.finished.clear();
        self.semaphores = None;
        self.segment = None;
    }
}

impl Drop for KeyedSemaphoreStrategy {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::ResourceKind;
    use std::io::{self, Cursor, Read};
    use std::sync::Arc;

    fn stream(bytes: &[u8]) -> InputStream {
        Box::new(Cursor::new(bytes.to_vec()))
    }

    struct BrokenAfter {
        left: usize,
    }

    impl Read for BrokenAfter {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.left == 0 {
                return Err(io::Error::other("device went away"));
            }
            let n = self.left.min(buf.len());
            buf[..n].fill(b'q');
            self.left -= n;
            Ok(n)
        }
    }

    fn start(strategy: &mut KeyedSemaphoreStrategy, inputs: Vec<InputStream>) {
        strategy.setup(inputs.len()).unwrap();
        for (i, input) in inputs.into_iter().enumerate() {
            strategy
                .spawn(WorkerDescriptor::new(i, format!("in{i}")), input)
                .unwrap();
        }
    }

    #[test]
    fn test_per_key_counts() {
        let mut strategy = KeyedSemaphoreStrategy::new(None, ResourceLedger::new());
        start(&mut strategy, vec![stream(b"aabc")]);
        let completion = strategy.await_completion().unwrap();
        let aggregate = strategy.aggregate().unwrap();

        assert_eq!(completion.summaries.len(), 1);
        assert_eq!(completion.summaries[0].counted, 4);
        assert_eq!(aggregate.table.get(b'a'), 2);
        assert_eq!(aggregate.table.get(b'b'), 1);
        assert_eq!(aggregate.table.get(b'c'), 1);
        assert_eq!(aggregate.table.total(), 4);
    }

    #[test]
    fn test_no_lost_updates() {
        const WORKERS: usize = 8;
        const PER_WORKER: usize = 10_000;

        let mut strategy = KeyedSemaphoreStrategy::new(None, ResourceLedger::new());
        start(
            &mut strategy,
            (0..WORKERS).map(|_| stream(&[b'a'; PER_WORKER])).collect(),
        );
        let completion = strategy.await_completion().unwrap();
        let aggregate = strategy.aggregate().unwrap();

        assert_eq!(aggregate.table.get(b'a'), (WORKERS * PER_WORKER) as u64);
        let counted: u64 = completion.summaries.iter().map(|s| s.counted).sum();
        assert_eq!(counted, (WORKERS * PER_WORKER) as u64);
    }

    #[test]
    fn test_high_bytes_skipped() {
        let mut strategy = KeyedSemaphoreStrategy::new(None, ResourceLedger::new());
        start(&mut strategy, vec![stream(&[b'a', 126, 127, 200, 255])]);
        let completion = strategy.await_completion().unwrap();
        let aggregate = strategy.aggregate().unwrap();

        assert_eq!(aggregate.table.range(), KeyRange::Ascii);
        assert_eq!(aggregate.table.total(), 2);
        assert_eq!(completion.summaries[0].counted, 2);
        assert_eq!(completion.summaries[0].skipped, 3);
        assert_eq!(completion.summaries[0].value_sum, u64::from(b'a') + 126);
    }

    #[test]
    fn test_semaphores_free_after_run() {
        let mut strategy = KeyedSemaphoreStrategy::new(None, ResourceLedger::new());
        start(&mut strategy, vec![stream(b"xyz"), stream(b"xx")]);
        strategy.await_completion().unwrap();

        let semaphores = strategy.semaphores.as_ref().unwrap();
        for key in [b'x', b'y', b'z', b'a'] {
            assert_eq!(semaphores.value(usize::from(key)).unwrap(), 1);
        }
    }

    #[test]
    fn test_failed_worker_aborts_run() {
        let ledger = ResourceLedger::new();
        let mut strategy = KeyedSemaphoreStrategy::new(None, ledger.clone());
        start(
            &mut strategy,
            vec![stream(b"abc"), Box::new(BrokenAfter { left: 3 })],
        );

        match strategy.await_completion() {
            Err(CountError::WorkerAborted { index, reason }) => {
                assert_eq!(index, 1);
                assert!(reason.contains("input error"), "{}", reason);
            }
            other => panic!("expected abort, got {:?}", other.map(|c| c.summaries)),
        }
        assert!(strategy.children.is_empty());

        strategy.teardown();
        assert!(ledger.is_balanced());
    }

    #[test]
    fn test_abort_kills_slow_workers() {
        let hook: IncrementHook = Arc::new(|key| {
            if key == b'z' {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        let mut strategy = KeyedSemaphoreStrategy::new(Some(hook), ResourceLedger::new());
        // the first worker would need minutes to finish
        start(
            &mut strategy,
            vec![stream(&[b'z'; 100_000]), Box::new(BrokenAfter { left: 0 })],
        );

        let err = strategy.await_completion().unwrap_err();
        assert!(matches!(err, CountError::WorkerAborted { index: 1, .. }));
        assert!(strategy.children.is_empty());
    }

    #[test]
    fn test_resources_balanced() {
        let ledger = ResourceLedger::new();
        let mut strategy = KeyedSemaphoreStrategy::new(None, ledger.clone());
        start(&mut strategy, vec![stream(b"hello")]);
        assert_eq!(ledger.created(ResourceKind::SharedSegment), 1);
        assert_eq!(ledger.created(ResourceKind::SemaphoreSet), 1);

        strategy.await_completion().unwrap();
        strategy.aggregate().unwrap();
        strategy.teardown();
        assert!(ledger.is_balanced());
    }

    #[test]
    fn test_teardown_kills_running_workers() {
        let hook: IncrementHook = Arc::new(|_| std::thread::sleep(Duration::from_millis(1)));
        let ledger = ResourceLedger::new();
        let mut strategy = KeyedSemaphoreStrategy::new(Some(hook), ledger.clone());
        start(&mut strategy, vec![stream(&[b'w'; 100_000])]);

        strategy.teardown();
        assert!(strategy.children.is_empty());
        assert!(ledger.is_balanced());
    }

    #[test]
    fn test_exit_descriptions() {
        assert!(describe_exit(EXIT_SYNC).contains("semaphore"));
        assert!(describe_exit(EXIT_PANIC).contains("panicked"));
        assert_eq!(describe_exit(42), "exited with status 42 (failed)");
    }
}
