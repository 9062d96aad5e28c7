//! Command line front end: count the bytes of the given files.
//!
//! Run with:
//! ```bash
//! cargo run -- --strategy barrier-merge --format table README.md Cargo.toml
//! ```

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use bytetally::config::{RunConfig, MAX_WORKERS};
use bytetally::coordinator::Coordinator;
use bytetally::observers::json::JsonObserver;
use bytetally::observers::table::{CellSeparator, TableObserver, TableStyle};
use bytetally::observers::Result as ObserverResult;
use bytetally::report::Report;
use bytetally::strategy::StrategyKind;
use clap::{Parser, ValueEnum};
use log::debug;

/// Synchronization strategy selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyChoice {
    /// Worker processes, shared memory, one semaphore per key
    KeyedSemaphore,
    /// Worker threads, one table behind one mutex
    Mutex,
    /// Worker threads with private tables merged after a barrier
    BarrierMerge,
}

impl From<StrategyChoice> for StrategyKind {
    fn from(choice: StrategyChoice) -> Self {
        match choice {
            StrategyChoice::KeyedSemaphore => StrategyKind::KeyedSemaphore,
            StrategyChoice::Mutex => StrategyKind::Mutex,
            StrategyChoice::BarrierMerge => StrategyKind::BarrierMerge,
        }
    }
}

/// Output format for the result.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// One line per counted key, then the total
    Text,
    /// Pretty ASCII table, one row per key
    Table,
    /// Compact table with multiple columns
    Compact,
    /// JSON format
    Json,
}

/// Table style selection.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum StyleChoice {
    Ascii,
    #[default]
    Rounded,
    Sharp,
    Modern,
    Extended,
    Markdown,
    Rst,
    Dots,
    Blank,
}

impl From<StyleChoice> for TableStyle {
    fn from(choice: StyleChoice) -> Self {
        match choice {
            StyleChoice::Ascii => TableStyle::Ascii,
            StyleChoice::Rounded => TableStyle::Rounded,
            StyleChoice::Sharp => TableStyle::Sharp,
            StyleChoice::Modern => TableStyle::Modern,
            StyleChoice::Extended => TableStyle::Extended,
            StyleChoice::Markdown => TableStyle::Markdown,
            StyleChoice::Rst => TableStyle::ReStructuredText,
            StyleChoice::Dots => TableStyle::Dots,
            StyleChoice::Blank => TableStyle::Blank,
        }
    }
}

/// Separator style for compact table format.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum SeparatorChoice {
    #[default]
    Colon,
    Equals,
    Arrow,
    Pipe,
    Space,
}

impl From<SeparatorChoice> for CellSeparator {
    fn from(choice: SeparatorChoice) -> Self {
        match choice {
            SeparatorChoice::Colon => CellSeparator::Colon,
            SeparatorChoice::Equals => CellSeparator::Equals,
            SeparatorChoice::Arrow => CellSeparator::Arrow,
            SeparatorChoice::Pipe => CellSeparator::Pipe,
            SeparatorChoice::Space => CellSeparator::Space,
        }
    }
}

/// Count occurrences of every byte value across files, one worker per file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files to count
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Synchronization strategy
    #[arg(short = 'm', long, value_enum, default_value = "mutex")]
    strategy: StrategyChoice,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Table style (for table/compact formats)
    #[arg(short, long, value_enum, default_value = "rounded")]
    style: StyleChoice,

    /// Number of columns (for compact format)
    #[arg(short, long, default_value = "4")]
    columns: usize,

    /// Separator style (for compact format)
    #[arg(long, value_enum, default_value = "colon")]
    separator: SeparatorChoice,

    /// Pretty print JSON output
    #[arg(long)]
    pretty: bool,

    /// Include timestamp in JSON output
    #[arg(long)]
    timestamp: bool,

    /// Add a title to the output (table formats)
    #[arg(long)]
    title: Option<String>,

    /// Hide header in standard table mode
    #[arg(long)]
    no_header: bool,

    /// Also print a table of per-worker results (table formats)
    #[arg(short, long)]
    workers: bool,

    /// Sleep this many microseconds inside every increment
    #[arg(long, default_value = "0")]
    delay_us: u64,

    /// Refuse to run with more inputs than this
    #[arg(long, default_value_t = MAX_WORKERS)]
    max_workers: usize,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

/// Writes `report` to `out` in the selected format.
fn render_output(args: &Args, report: &Report, mut out: impl Write) -> ObserverResult<()> {
    match args.format {
        OutputFormat::Text => {
            writeln!(out, "{}", report)?;
        }

        OutputFormat::Table | OutputFormat::Compact => {
            let mut observer = TableObserver::new().style(args.style.into());
            observer = match args.format {
                OutputFormat::Compact => observer.grid(args.columns, args.separator.into()),
                _ => observer.rows(!args.no_header),
            };
            if let Some(ref title) = args.title {
                observer = observer.title(title.as_str());
            }

            writeln!(out, "{}", observer.render(report))?;
            if args.workers {
                writeln!(out, "{}", observer.render_workers(report))?;
            }
            writeln!(out, "Total count is: {}", report.total())?;
        }

        OutputFormat::Json => {
            JsonObserver::new()
                .pretty(args.pretty)
                .timestamped(args.timestamp)
                .write_to(report, &mut out)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);
    debug!("{:?}", args);

    let config = RunConfig::new(args.strategy.into())
        .with_max_workers(args.max_workers)
        .with_delay(Duration::from_micros(args.delay_us));

    let report = match Coordinator::new(config).run(&args.inputs) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("bytetally: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = render_output(&args, &report, io::stdout().lock()) {
        eprintln!("bytetally: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
