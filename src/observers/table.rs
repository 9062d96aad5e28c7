//! Grid rendering of a [`Report`] with `tabled`.
//!
//! Two layouts are available. [`Layout::Rows`] prints one row per counted
//! key; [`Layout::Grid`] packs `label (key): count` cells several to a row,
//! which keeps a full 256-key listing on one screen.
//!
//! Requires the `table` feature.
//!
//! ```rust
//! use bytetally::observers::table::{CellSeparator, TableObserver, TableStyle};
//! use bytetally::report::Report;
//! use bytetally::strategy::StrategyKind;
//! use bytetally::table::{CounterTable, KeyRange};
//!
//! let mut table = CounterTable::new(KeyRange::Full);
//! for byte in b"aab\n" {
//!     table.increment(*byte);
//! }
//! let report = Report::new(StrategyKind::Mutex, table);
//!
//! println!("{}", TableObserver::new().style(TableStyle::Rounded).render(&report));
//! // ╭─────┬───────────────────┬───────╮
//! // │ Key │ Char              │ Count │
//! // ├─────┼───────────────────┼───────┤
//! // │ 10  │ special character │ 1     │
//! // │ 97  │ a                 │ 2     │
//! // │ 98  │ b                 │ 1     │
//! // ╰─────┴───────────────────┴───────╯
//!
//! let grid = TableObserver::new().grid(3, CellSeparator::Colon).render(&report);
//! assert!(grid.contains("a (97): 2"));
//! ```

use std::fmt;

use tabled::builder::Builder;
use tabled::settings::object::Rows;
use tabled::settings::{Remove, Style};
use tabled::{Table, Tabled};

use crate::report::{KeyCount, Report};

/// Border style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TableStyle {
    /// `+`, `-` and `|` only.
    Ascii,
    /// Box drawing with rounded corners.
    #[default]
    Rounded,
    /// Box drawing with square corners.
    Sharp,
    /// Box drawing with a line between every row.
    Modern,
    /// Double-line box drawing.
    Extended,
    /// GitHub-flavoured Markdown.
    Markdown,
    /// reStructuredText simple table.
    ReStructuredText,
    /// Dotted borders.
    Dots,
    /// Whitespace only.
    Blank,
}

impl TableStyle {
    fn apply(self, table: &mut Table) {
        let _ = match self {
            TableStyle::Ascii => table.with(Style::ascii()),
            TableStyle::Rounded => table.with(Style::rounded()),
            TableStyle::Sharp => table.with(Style::sharp()),
            TableStyle::Modern => table.with(Style::modern()),
            TableStyle::Extended => table.with(Style::extended()),
            TableStyle::Markdown => table.with(Style::markdown()),
            TableStyle::ReStructuredText => table.with(Style::re_structured_text()),
            TableStyle::Dots => table.with(Style::dots()),
            TableStyle::Blank => table.with(Style::blank()),
        };
    }
}

/// What sits between a key and its count in a grid cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CellSeparator {
    /// `a (97): 2`
    #[default]
    Colon,
    /// `a (97) = 2`
    Equals,
    /// `a (97) → 2`
    Arrow,
    /// `a (97) | 2`
    Pipe,
    /// `a (97) 2`
    Space,
}

impl fmt::Display for CellSeparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CellSeparator::Colon => ": ",
            CellSeparator::Equals => " = ",
            CellSeparator::Arrow => " → ",
            CellSeparator::Pipe => " | ",
            CellSeparator::Space => " ",
        })
    }
}

/// How counted keys are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One row per key, optionally under a `Key | Char | Count` header.
    Rows {
        /// Print the header row.
        header: bool,
    },
    /// Several `label (key)<separator>count` cells per row.
    Grid {
        /// Cells per row, at least 1.
        columns: usize,
        /// Key/count separator.
        separator: CellSeparator,
    },
}

impl Default for Layout {
    fn default() -> Self {
        Layout::Rows { header: true }
    }
}

#[derive(Tabled)]
struct KeyRow {
    #[tabled(rename = "Key")]
    key: u8,
    #[tabled(rename = "Char")]
    label: String,
    #[tabled(rename = "Count")]
    count: u64,
}

impl From<KeyCount> for KeyRow {
    fn from(entry: KeyCount) -> Self {
        Self {
            key: entry.key,
            label: entry.label,
            count: entry.count,
        }
    }
}

#[derive(Tabled)]
struct WorkerRow {
    #[tabled(rename = "Worker")]
    index: usize,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Counted")]
    counted: String,
    #[tabled(rename = "Skipped")]
    skipped: String,
    #[tabled(rename = "Value sum")]
    value_sum: String,
    #[tabled(rename = "Status")]
    status: String,
}

impl WorkerRow {
    fn unfinished(index: usize, source: &str, status: String) -> Self {
        Self {
            index,
            source: source.to_string(),
            counted: "-".into(),
            skipped: "-".into(),
            value_sum: "-".into(),
            status,
        }
    }
}

/// Renders reports as tables.
#[derive(Debug, Clone, Default)]
pub struct TableObserver {
    style: TableStyle,
    layout: Layout,
    title: Option<String>,
    filler: String,
}

impl TableObserver {
    /// Row layout with a header, rounded borders, no title.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the border style.
    pub fn style(mut self, style: TableStyle) -> Self {
        self.style = style;
        self
    }

    /// Sets the layout.
    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = match layout {
            Layout::Grid { columns, separator } => Layout::Grid {
                columns: columns.max(1),
                separator,
            },
            rows => rows,
        };
        self
    }

    /// Shorthand for [`Layout::Rows`].
    pub fn rows(self, header: bool) -> Self {
        self.layout(Layout::Rows { header })
    }

    /// Shorthand for [`Layout::Grid`].
    pub fn grid(self, columns: usize, separator: CellSeparator) -> Self {
        self.layout(Layout::Grid { columns, separator })
    }

    /// Prints `title` on its own line above the table.
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Text for the unused cells of a grid's last row.
    pub fn filler(mut self, filler: impl Into<String>) -> Self {
        self.filler = filler.into();
        self
    }

    /// The layout in use.
    pub fn current_layout(&self) -> Layout {
        self.layout
    }

    fn titled(&self, mut table: Table) -> String {
        self.style.apply(&mut table);
        match &self.title {
            Some(title) => format!("{}\n{}", title, table),
            None => table.to_string(),
        }
    }

    /// Renders the non-zero counters of `report`.
    ///
    /// A grid over an empty report renders as an empty string.
    pub fn render(&self, report: &Report) -> String {
        match self.layout {
            Layout::Rows { header } => {
                let rows: Vec<KeyRow> = report.entries().map(KeyRow::from).collect();
                let mut table = Table::new(rows);
                if !header {
                    table.with(Remove::row(Rows::first()));
                }
                self.titled(table)
            }
            Layout::Grid { columns, separator } => {
                let cells: Vec<String> = report
                    .entries()
                    .map(|e| format!("{} ({}){}{}", e.label, e.key, separator, e.count))
                    .collect();
                if cells.is_empty() {
                    return String::new();
                }
                let mut builder = Builder::default();
                for chunk in cells.chunks(columns) {
                    let mut record = chunk.to_vec();
                    record.resize(columns, self.filler.clone());
                    builder.push_record(record);
                }
                self.titled(builder.build())
            }
        }
    }

    /// Renders one row per worker: finished, failed, then never started.
    pub fn render_workers(&self, report: &Report) -> String {
        let finished = report.workers.iter().map(|w| WorkerRow {
            index: w.index,
            source: w.source.clone(),
            counted: w.counted.to_string(),
            skipped: w.skipped.to_string(),
            value_sum: w.value_sum.to_string(),
            status: "ok".into(),
        });
        let failed = report.failed.iter().map(|f| {
            WorkerRow::unfinished(f.index, &f.source, format!("failed: {}", f.reason))
        });
        let skipped = report.skipped.iter().map(|f| {
            WorkerRow::unfinished(f.index, &f.source, format!("not started: {}", f.reason))
        });

        let mut table = Table::new(finished.chain(failed).chain(skipped));
        self.style.apply(&mut table);
        table.to_string()
    }
}
