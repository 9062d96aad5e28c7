//! Serializable snapshot of a finished run.
//!
//! A [`TallySnapshot`] is the owned, serde-friendly form of a
//! [`Report`]: non-zero counters, per-worker results and an optional
//! timestamp.
//!
//! # Feature Flag
//!
//! This module requires the `serde` feature:
//!
//! ```toml
//! [dependencies]
//! bytetally = { version = "0.1", features = ["serde"] }
//! ```

use serde::{Deserialize, Serialize};

use crate::report::{KeyCount, Report};
use crate::strategy::{StrategyKind, WorkerSubtotal};
use crate::table::{CounterTable, KeyRange};
use crate::worker::{WorkerFailure, WorkerSummary};

/// Point-in-time capture of a [`Report`].
///
/// # Examples
///
/// ```rust
/// use bytetally::report::Report;
/// use bytetally::snapshot::TallySnapshot;
/// use bytetally::strategy::StrategyKind;
/// use bytetally::table::{CounterTable, KeyRange};
///
/// let mut table = CounterTable::new(KeyRange::Full);
/// table.increment(b'a');
/// let snapshot = TallySnapshot::from_report(&Report::new(StrategyKind::Mutex, table));
/// assert_eq!(snapshot.total, 1);
/// assert_eq!(snapshot.get(b'a').map(|k| k.count), Some(1));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TallySnapshot {
    /// Optional timestamp in milliseconds since Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub timestamp_ms: Option<u64>,
    /// Strategy that produced the counts.
    pub strategy: StrategyKind,
    /// Key range of the table.
    pub range: KeyRange,
    /// Sum of all counters.
    pub total: u64,
    /// Non-zero counters in key order.
    pub counts: Vec<KeyCount>,
    /// Workers that finished.
    pub workers: Vec<WorkerSummary>,
    /// Barrier sub-totals.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub subtotals: Vec<WorkerSubtotal>,
    /// Workers that failed.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failed: Vec<WorkerFailure>,
    /// Workers that never started.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub skipped: Vec<WorkerFailure>,
}

impl TallySnapshot {
    /// Captures `report`.
    pub fn from_report(report: &Report) -> Self {
        Self {
            timestamp_ms: None,
            strategy: report.strategy,
            range: report.table.range(),
            total: report.total(),
            counts: report.entries().collect(),
            workers: report.workers.clone(),
            subtotals: report.subtotals.clone(),
            failed: report.failed.clone(),
            skipped: report.skipped.clone(),
        }
    }

    /// Sets the timestamp.
    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    /// Finds the entry for `key`, if it was counted.
    pub fn get(&self, key: u8) -> Option<&KeyCount> {
        self.counts.iter().find(|c| c.key == key)
    }

    /// Rebuilds the counter table.
    pub fn to_table(&self) -> CounterTable {
        let mut counts = vec![0u64; self.range.width()];
        for entry in &self.counts {
            if let Some(slot) = counts.get_mut(usize::from(entry.key)) {
                *slot = entry.count;
            }
        }
        CounterTable::from_counts(self.range, &counts)
    }
}

impl From<&Report> for TallySnapshot {
    fn from(report: &Report) -> Self {
        Self::from_report(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> Report {
        let mut table = CounterTable::new(KeyRange::Ascii);
        for byte in b"aab\n" {
            table.increment(*byte);
        }
        let mut report = Report::new(StrategyKind::KeyedSemaphore, table);
        report.workers.push(WorkerSummary {
            index: 0,
            source: "in.txt".into(),
            counted: 4,
            skipped: 0,
            value_sum: 97 + 97 + 98 + 10,
        });
        report
    }

    #[test]
    fn test_from_report() {
        let snapshot = TallySnapshot::from_report(&report());
        assert_eq!(snapshot.strategy, StrategyKind::KeyedSemaphore);
        assert_eq!(snapshot.range, KeyRange::Ascii);
        assert_eq!(snapshot.total, 4);
        assert_eq!(snapshot.counts.len(), 3);
        assert_eq!(snapshot.get(b'a').unwrap().label, "a");
        assert_eq!(snapshot.get(b'\n').unwrap().label, "special character");
        assert!(snapshot.get(b'z').is_none());
        assert!(snapshot.timestamp_ms.is_none());
    }

    #[test]
    fn test_to_table_restores_counts() {
        let report = report();
        let snapshot = TallySnapshot::from_report(&report);
        assert_eq!(snapshot.to_table(), report.table);
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_serialize_skips_empty_sections() {
        let json = serde_json::to_string(&TallySnapshot::from_report(&report())).unwrap();
        assert!(json.contains(r#""strategy":"keyed-semaphore""#));
        assert!(json.contains(r#""range":"ascii""#));
        assert!(!json.contains("timestamp_ms"));
        assert!(!json.contains("subtotals"));
        assert!(!json.contains("failed"));
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_deserialize_snapshot() {
        let json = r#"{
            "timestamp_ms": 1234567890,
            "strategy": "mutex",
            "range": "full",
            "total": 2,
            "counts": [{"key": 97, "label": "a", "count": 2}],
            "workers": []
        }"#;
        let snapshot: TallySnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.timestamp_ms, Some(1234567890));
        assert_eq!(snapshot.strategy, StrategyKind::Mutex);
        assert_eq!(snapshot.to_table().get(b'a'), 2);
        assert!(snapshot.failed.is_empty());
    }
}
