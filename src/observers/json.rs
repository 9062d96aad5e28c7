//! JSON output.
//!
//! [`JsonObserver`] captures a [`Report`] as a [`TallySnapshot`] and hands it
//! to `serde_json`. Needs the `json` feature.
//!
//! ```rust
//! use bytetally::observers::json::JsonObserver;
//! use bytetally::report::Report;
//! use bytetally::strategy::StrategyKind;
//! use bytetally::table::{CounterTable, KeyRange};
//!
//! let mut table = CounterTable::new(KeyRange::Full);
//! table.increment(b'a');
//! let report = Report::new(StrategyKind::Mutex, table);
//!
//! let json = JsonObserver::new().to_json(&report).unwrap();
//! assert!(json.contains(r#""total":1"#));
//! ```

use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::observers::Result;
use crate::report::Report;
use crate::snapshot::TallySnapshot;

/// Serializes reports as [`TallySnapshot`] JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonObserver {
    pretty: bool,
    timestamped: bool,
}

impl JsonObserver {
    /// Compact output without a timestamp.
    pub fn new() -> Self {
        Self::default()
    }

    /// Indents the output.
    pub fn pretty(mut self, enabled: bool) -> Self {
        self.pretty = enabled;
        self
    }

    /// Adds `timestamp_ms`, the wall-clock time of serialization.
    pub fn timestamped(mut self, enabled: bool) -> Self {
        self.timestamped = enabled;
        self
    }

    /// The snapshot that [`to_json`](Self::to_json) would serialize.
    pub fn collect(&self, report: &Report) -> TallySnapshot {
        let snapshot = TallySnapshot::from_report(report);
        if !self.timestamped {
            return snapshot;
        }
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);
        snapshot.with_timestamp(now_ms)
    }

    /// Serializes `report` into a string.
    pub fn to_json(&self, report: &Report) -> Result<String> {
        let snapshot = self.collect(report);
        let json = if self.pretty {
            serde_json::to_string_pretty(&snapshot)?
        } else {
            serde_json::to_string(&snapshot)?
        };
        Ok(json)
    }

    /// Serializes `report` into `writer` and ends the line.
    pub fn write_to<W: Write>(&self, report: &Report, mut writer: W) -> Result<()> {
        let snapshot = self.collect(report);
        if self.pretty {
            serde_json::to_writer_pretty(&mut writer, &snapshot)?;
        } else {
            serde_json::to_writer(&mut writer, &snapshot)?;
        }
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observers::ObserverError;
    use crate::strategy::{StrategyKind, WorkerSubtotal};
    use crate::table::{CounterTable, KeyRange};
    use std::io;

    fn report(bytes: &[u8]) -> Report {
        let mut table = CounterTable::new(KeyRange::Full);
        for byte in bytes {
            table.increment(*byte);
        }
        Report::new(StrategyKind::BarrierMerge, table)
    }

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_to_json_empty() {
        let json = JsonObserver::new().to_json(&report(b"")).unwrap();
        assert!(json.contains(r#""total":0"#));
        assert!(json.contains(r#""counts":[]"#));
    }

    #[test]
    fn test_to_json_counts() {
        let json = JsonObserver::new().to_json(&report(b"aa\t")).unwrap();
        assert!(json.contains(r#""strategy":"barrier-merge""#));
        assert!(json.contains(r#"{"key":97,"label":"a","count":2}"#));
        assert!(json.contains(r#"{"key":9,"label":"special character","count":1}"#));
    }

    #[test]
    fn test_to_json_pretty() {
        let json = JsonObserver::new().pretty(true).to_json(&report(b"a")).unwrap();
        assert!(json.contains('\n'));
    }

    #[test]
    fn test_to_json_with_timestamp() {
        let observer = JsonObserver::new().timestamped(true);
        let json = observer.to_json(&report(b"a")).unwrap();
        assert!(json.contains("timestamp_ms"));

        let json = JsonObserver::new().to_json(&report(b"a")).unwrap();
        assert!(!json.contains("timestamp_ms"));
    }

    #[test]
    fn test_subtotals_serialized() {
        let mut report = report(b"ab");
        report.subtotals.push(WorkerSubtotal {
            index: 0,
            counted: 2,
            value_sum: 195,
        });
        let json = JsonObserver::new().to_json(&report).unwrap();
        assert!(json.contains(r#""subtotals":[{"index":0,"counted":2,"value_sum":195}]"#));
    }

    #[test]
    fn test_round_trip_through_snapshot() {
        let report = report(b"hello");
        let json = JsonObserver::new().to_json(&report).unwrap();
        let snapshot: TallySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot.to_table(), report.table);
    }

    #[test]
    fn test_write_to() {
        let mut out = Vec::new();
        JsonObserver::new().write_to(&report(b"x"), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("}\n"));
    }

    #[test]
    fn test_write_to_reports_io_errors() {
        let err = JsonObserver::new()
            .write_to(&report(b"x"), ClosedPipe)
            .unwrap_err();
        // serde_json wraps writer errors in its own type
        assert!(matches!(err, ObserverError::Json(_) | ObserverError::Io(_)));
    }

    #[test]
    fn test_collect_stamps_snapshot() {
        let snapshot = JsonObserver::new().timestamped(true).collect(&report(b"a"));
        assert!(snapshot.timestamp_ms.is_some_and(|ms| ms > 0));
        assert!(JsonObserver::new().collect(&report(b"a")).timestamp_ms.is_none());
    }
}
