//! The worker unit: one input stream in, one increment per admitted byte out.
//!
//! A [`WorkerUnit`] knows nothing about locks. It reads its stream in fixed
//! chunks, drops bytes outside the strategy's [`KeyRange`], and hands every
//! other byte to an [`Increment`] sink supplied by the active strategy.
//!
//! The read buffer lives on the stack and the per-byte loop never allocates.
//! Allocation happens once per stream: the summary copies the source name at
//! end of input, and a failure builds its error value.

use std::fmt::{self, Debug};
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{CountError, Result};
use crate::table::{CounterTable, KeyRange};

/// Size of the per-worker read buffer.
pub const READ_CHUNK: usize = 8 * 1024;

/// Callback run inside every increment, after the counter update and before
/// the lock is given back.
///
/// This is where tests widen race windows or make a worker fail on purpose.
/// Under the keyed-semaphore strategy the hook runs in the worker process.
pub type IncrementHook = Arc<dyn Fn(u8) + Send + Sync>;

/// Safely adds one occurrence of a key.
///
/// Each strategy provides its own implementation: a semaphore-guarded shared
/// slot, a mutex-guarded shared table, or a plain private table.
pub trait Increment {
    /// Adds one occurrence of `key`.
    fn increment(&mut self, key: u8) -> Result<()>;
}

impl Increment for CounterTable {
    #[inline]
    fn increment(&mut self, key: u8) -> Result<()> {
        CounterTable::increment(self, key);
        Ok(())
    }
}

/// Identifies one worker: its index and the source it reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDescriptor {
    /// Position of the worker's input on the command line, from zero.
    pub index: usize,
    /// Display name of the input.
    pub source: String,
}

impl WorkerDescriptor {
    /// Creates a descriptor.
    pub fn new(index: usize, source: impl Into<String>) -> Self {
        Self {
            index,
            source: source.into(),
        }
    }
}

impl fmt::Display for WorkerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker {} ({})", self.index, self.source)
    }
}

/// What a worker did with its stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkerSummary {
    /// Worker index.
    pub index: usize,
    /// Display name of the input.
    pub source: String,
    /// Bytes handed to the increment sink.
    pub counted: u64,
    /// Bytes outside the key range.
    pub skipped: u64,
    /// Sum of the values of all counted bytes.
    pub value_sum: u64,
}

/// A worker that failed or could not be started.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WorkerFailure {
    /// Worker index.
    pub index: usize,
    /// Display name of the input.
    pub source: String,
    /// What went wrong.
    pub reason: String,
}

impl WorkerFailure {
    pub(crate) fn new(descriptor: &WorkerDescriptor, reason: impl ToString) -> Self {
        Self {
            index: descriptor.index,
            source: descriptor.source.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Consumes one input stream and feeds admitted bytes to a sink.
pub struct WorkerUnit {
    descriptor: WorkerDescriptor,
    range: KeyRange,
}

impl WorkerUnit {
    /// Creates a worker for `descriptor` counting keys in `range`.
    pub fn new(descriptor: WorkerDescriptor, range: KeyRange) -> Self {
        Self { descriptor, range }
    }

    /// The worker's descriptor.
    pub fn descriptor(&self) -> &WorkerDescriptor {
        &self.descriptor
    }

    /// Reads `input` to end of stream, incrementing `sink` once per admitted byte.
    ///
    /// The first error from the sink stops the worker and is returned as is.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use bytetally::table::{CounterTable, KeyRange};
    /// use bytetally::worker::{WorkerDescriptor, WorkerUnit};
    ///
    /// let worker = WorkerUnit::new(WorkerDescriptor::new(0, "mem"), KeyRange::Full);
    /// let mut table = CounterTable::new(KeyRange::Full);
    /// let summary = worker.run(&b"aabc"[..], &mut table).unwrap();
    /// assert_eq!(summary.counted, 4);
    /// assert_eq!(table.get(b'a'), 2);
    /// ```
    pub fn run<R, S>(&self, mut input: R, sink: &mut S) -> Result<WorkerSummary>
    where
        R: Read,
        S: Increment + ?Sized,
    {
        let mut buf = [0u8; READ_CHUNK];
        let mut counted = 0u64;
        let mut skipped = 0u64;
        let mut value_sum = 0u64;

        loop {
            let n = match input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(CountError::Input {
                        path: PathBuf::from(&self.descriptor.source),
                        source,
                    })
                }
            };

            for &byte in &buf[..n] {
                if self.range.admits(byte) {
                    sink.increment(byte)?;
                    counted += 1;
                    value_sum += u64::from(byte);
                } else {
                    skipped += 1;
                }
            }
        }

        Ok(WorkerSummary {
            index: self.descriptor.index,
            source: self.descriptor.source.clone(),
            counted,
            skipped,
            value_sum,
        })
    }
}

impl Debug for WorkerUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerUnit({}, {:?})", self.descriptor, self.range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    struct FailingReader {
        served: bool,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served {
                Err(io::Error::new(ErrorKind::BrokenPipe, "gone"))
            } else {
                self.served = true;
                buf[..3].copy_from_slice(b"abc");
                Ok(3)
            }
        }
    }

    struct Refusing;

    impl Increment for Refusing {
        fn increment(&mut self, _key: u8) -> Result<()> {
            Err(CountError::sync("lock", io::Error::other("refused")))
        }
    }

    fn unit(range: KeyRange) -> WorkerUnit {
        WorkerUnit::new(WorkerDescriptor::new(3, "test"), range)
    }

    #[test]
    fn test_counts_every_byte_full_range() {
        let mut table = CounterTable::new(KeyRange::Full);
        let input: Vec<u8> = (0..=255u8).collect();
        let summary = unit(KeyRange::Full).run(&input[..], &mut table).unwrap();
        assert_eq!(summary.counted, 256);
        assert_eq!(summary.skipped, 0);
        assert!(table.as_slice().iter().all(|c| *c == 1));
    }

    #[test]
    fn test_ascii_range_skips_high_bytes() {
        let mut table = CounterTable::new(KeyRange::Ascii);
        let input = [b'a', 127, 200, 255, b'~'];
        let summary = unit(KeyRange::Ascii).run(&input[..], &mut table).unwrap();
        assert_eq!(summary.counted, 2);
        assert_eq!(summary.skipped, 3);
        assert_eq!(table.get(b'a'), 1);
        assert_eq!(table.get(b'~'), 1);
        assert_eq!(table.get(127), 0);
    }

    #[test]
    fn test_summary_fields() {
        let mut table = CounterTable::new(KeyRange::Full);
        let summary = unit(KeyRange::Full).run(&b"ab"[..], &mut table).unwrap();
        assert_eq!(summary.index, 3);
        assert_eq!(summary.source, "test");
        assert_eq!(summary.value_sum, u64::from(b'a') + u64::from(b'b'));
    }

    #[test]
    fn test_empty_input() {
        let mut table = CounterTable::new(KeyRange::Full);
        let summary = unit(KeyRange::Full).run(io::empty(), &mut table).unwrap();
        assert_eq!(summary.counted, 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_input_spanning_many_chunks() {
        let mut table = CounterTable::new(KeyRange::Full);
        let input = vec![b'x'; READ_CHUNK * 3 + 17];
        let summary = unit(KeyRange::Full).run(&input[..], &mut table).unwrap();
        assert_eq!(summary.counted, input.len() as u64);
        assert_eq!(table.get(b'x'), input.len() as u64);
    }

    #[test]
    fn test_read_error_is_input_error() {
        let mut table = CounterTable::new(KeyRange::Full);
        let err = unit(KeyRange::Full)
            .run(FailingReader { served: false }, &mut table)
            .unwrap_err();
        assert!(matches!(err, CountError::Input { ref path, .. } if path.to_str() == Some("test")));
        // bytes read before the failure were counted
        assert_eq!(table.total(), 3);
    }

    #[test]
    fn test_sink_error_stops_worker() {
        let err = unit(KeyRange::Full)
            .run(&b"abc"[..], &mut Refusing)
            .unwrap_err();
        assert!(matches!(err, CountError::Synchronization { op: "lock", .. }));
    }
}
