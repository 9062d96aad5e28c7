//! The outcome of a counting run.
//!
//! A [`Report`] is the coordinator's final product: the table, the strategy
//! that produced it, and what happened to each worker. Its [`Display`]
//! output is the plain listing printed by the command line tool:
//!
//! ```text
//! Counter for a (97) is: 2
//! Counter for b (98) is: 1
//! Counter for special character (10) is: 1
//! Total count is: 4
//! ```
//!
//! Keys 33 through 126 are shown as characters; everything else (space,
//! control bytes, bytes above 126) is a "special character".

use std::fmt;

use crate::strategy::{StrategyKind, WorkerSubtotal};
use crate::table::CounterTable;
use crate::worker::{WorkerFailure, WorkerSummary};

/// Lowest key printed as a character.
pub const FIRST_PRINTABLE: u8 = 33;

/// Highest key printed as a character.
pub const LAST_PRINTABLE: u8 = 126;

/// Returns `true` if `key` is listed as a character rather than a number.
pub const fn is_printable(key: u8) -> bool {
    key >= FIRST_PRINTABLE && key <= LAST_PRINTABLE
}

/// Human readable name of a key: the character itself, or `special character`.
///
/// # Examples
///
/// ```rust
/// use bytetally::report::key_label;
///
/// assert_eq!(key_label(b'a'), "a");
/// assert_eq!(key_label(b' '), "special character");
/// assert_eq!(key_label(200), "special character");
/// ```
pub fn key_label(key: u8) -> String {
    if is_printable(key) {
        char::from(key).to_string()
    } else {
        "special character".to_string()
    }
}

/// One non-zero line of the listing.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct KeyCount {
    /// Byte value.
    pub key: u8,
    /// Output of [`key_label`].
    pub label: String,
    /// Occurrences.
    pub count: u64,
}

impl KeyCount {
    /// Builds the entry for `key`.
    pub fn new(key: u8, count: u64) -> Self {
        Self {
            key,
            label: key_label(key),
            count,
        }
    }
}

impl fmt::Display for KeyCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Counter for {} ({}) is: {}",
            self.label, self.key, self.count
        )
    }
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct Report {
    /// Strategy that produced the counts.
    pub strategy: StrategyKind,
    /// The final table.
    pub table: CounterTable,
    /// Workers that read their input to the end, by index.
    pub workers: Vec<WorkerSummary>,
    /// Per-worker totals published before the barrier (barrier strategy only).
    pub subtotals: Vec<WorkerSubtotal>,
    /// Workers that stopped early without aborting the run.
    pub failed: Vec<WorkerFailure>,
    /// Workers that could not be started.
    pub skipped: Vec<WorkerFailure>,
}

impl Report {
    /// An empty report for `strategy`.
    pub fn new(strategy: StrategyKind, table: CounterTable) -> Self {
        Self {
            strategy,
            table,
            workers: Vec::new(),
            subtotals: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Sum of all counters.
    pub fn total(&self) -> u64 {
        self.table.total()
    }

    /// Sum of the byte values of everything counted.
    pub fn value_sum(&self) -> u64 {
        self.table
            .iter_nonzero()
            .map(|(key, count)| u64::from(key) * count)
            .sum()
    }

    /// Returns `true` if every worker read its input to the end.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// Non-zero counters in key order.
    pub fn entries(&self) -> impl Iterator<Item = KeyCount> + '_ {
        self.table
            .iter_nonzero()
            .map(|(key, count)| KeyCount::new(key, count))
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.entries() {
            writeln!(f, "{}", entry)?;
        }
        for subtotal in &self.subtotals {
            writeln!(
                f,
                "Count of worker {} is: {} (value sum {})",
                subtotal.index, subtotal.counted, subtotal.value_sum
            )?;
        }
        for failure in &self.failed {
            writeln!(
                f,
                "Worker {} ({}) failed: {}",
                failure.index, failure.source, failure.reason
            )?;
        }
        for skip in &self.skipped {
            writeln!(
                f,
                "Worker {} ({}) was not started: {}",
                skip.index, skip.source, skip.reason
            )?;
        }
        write!(f, "Total count is: {}", self.total())
    }
}
