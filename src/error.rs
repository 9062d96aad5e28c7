//! Error type shared by every counting run.
//!
//! Which variants are fatal depends on the strategy: a
//! [`Synchronization`](CountError::Synchronization) failure aborts the whole
//! run under the keyed-semaphore and barrier strategies, but only ends the
//! offending worker under the mutex strategy. [`Spawn`](CountError::Spawn)
//! failures are never fatal; the coordinator logs them and carries on.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while setting up, running or tearing down a count.
#[derive(Debug, Error)]
pub enum CountError {
    /// A shared table, semaphore set, mutex or barrier could not be allocated.
    #[error("cannot create {resource}: {source}")]
    ResourceCreation {
        /// What was being created.
        resource: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// An acquire, release or wait call failed.
    #[error("{op} failed: {source}")]
    Synchronization {
        /// The primitive operation that failed.
        op: &'static str,
        /// The underlying cause.
        #[source]
        source: io::Error,
    },

    /// A worker process terminated abnormally and the run was aborted.
    #[error("worker {index} aborted: {reason}")]
    WorkerAborted {
        /// Index of the worker that failed first.
        index: usize,
        /// Exit status or signal, in words.
        reason: String,
    },

    /// An input source does not exist.
    #[error("input does not exist: {}", path.display())]
    InputMissing {
        /// The missing path.
        path: PathBuf,
    },

    /// Reading an input source failed.
    #[error("cannot read {}: {source}", path.display())]
    Input {
        /// The source being read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A worker could not be started. Non-fatal: the worker is skipped.
    #[error("cannot spawn worker {index}: {source}")]
    Spawn {
        /// Index of the worker that was skipped.
        index: usize,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// The run was started without any input.
    #[error("no input given")]
    NoInputs,

    /// More inputs were given than there may be workers.
    #[error("too many inputs: {given} given, limit is {max}")]
    TooManyInputs {
        /// Number of inputs supplied.
        given: usize,
        /// Worker limit in force.
        max: usize,
    },
}

impl CountError {
    pub(crate) fn sync(op: &'static str, source: impl Into<io::Error>) -> Self {
        CountError::Synchronization {
            op,
            source: source.into(),
        }
    }

    pub(crate) fn resource(resource: &'static str, source: impl Into<io::Error>) -> Self {
        CountError::ResourceCreation {
            resource,
            source: source.into(),
        }
    }
}

/// Result type for counting operations.
pub type Result<T> = std::result::Result<T, CountError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_input_missing() {
        let err = CountError::InputMissing {
            path: PathBuf::from("/no/such/file"),
        };
        assert_eq!(err.to_string(), "input does not exist: /no/such/file");
    }

    #[test]
    fn test_display_too_many() {
        let err = CountError::TooManyInputs { given: 300, max: 256 };
        assert_eq!(err.to_string(), "too many inputs: 300 given, limit is 256");
    }

    #[test]
    fn test_sync_keeps_source() {
        use std::error::Error as _;
        let err = CountError::sync("semaphore acquire", io::Error::from_raw_os_error(libc::EINVAL));
        assert!(err.to_string().starts_with("semaphore acquire failed"));
        assert!(err.source().is_some());
    }
}
