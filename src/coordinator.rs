//! Drives one counting run from inputs to [`Report`].
//!
//! ```text
//!   Idle ─► SpawningWorkers ─► AwaitingCompletion ─► Aggregating ─► Reporting ─► Released
//!    │            │                    │                   │                         ▲
//!    └────────────┴──────── error ─────┴───────────────────┴─────────────────────────┘
//! ```
//!
//! Every input is resolved and opened before the first worker starts, so a
//! missing file fails the run with nothing counted. Whatever happens after
//! that, the strategy's teardown runs before [`Coordinator::run`] returns.

use std::fmt;
use std::path::Path;

use log::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::{CountError, Result};
use crate::input::{InputSource, InputStream};
use crate::report::Report;
use crate::strategy::{StrategyKind, SyncStrategy};
use crate::table::CounterTable;
use crate::worker::{WorkerDescriptor, WorkerFailure};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing allocated yet.
    Idle,
    /// Shared resources exist, workers are being started.
    SpawningWorkers,
    /// Waiting on the strategy's completion primitive.
    AwaitingCompletion,
    /// Reading or merging the final table.
    Aggregating,
    /// Building the report.
    Reporting,
    /// Shared resources have been released.
    Released,
}

impl Phase {
    /// Short name used in logs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::SpawningWorkers => "spawning workers",
            Phase::AwaitingCompletion => "awaiting completion",
            Phase::Aggregating => "aggregating",
            Phase::Reporting => "reporting",
            Phase::Released => "released",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Creates, starts and awaits the workers of one run.
///
/// # Examples
///
/// ```rust,no_run
/// use bytetally::config::RunConfig;
/// use bytetally::coordinator::Coordinator;
/// use bytetally::strategy::StrategyKind;
///
/// let mut coordinator = Coordinator::new(RunConfig::new(StrategyKind::BarrierMerge));
/// let report = coordinator.run(&["a.txt", "b.txt"]).unwrap();
/// println!("{}", report);
/// ```
#[derive(Debug)]
pub struct Coordinator {
    config: RunConfig,
    phase: Phase,
}

impl Coordinator {
    /// Creates an idle coordinator.
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
        }
    }

    /// The run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// The phase the last run reached.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        debug!("{} -> {}", self.phase, phase);
        self.phase = phase;
    }

    fn check_count(&self, given: usize) -> Result<()> {
        if given == 0 {
            return Err(CountError::NoInputs);
        }
        let max = self.config.max_workers();
        if given > max {
            return Err(CountError::TooManyInputs { given, max });
        }
        Ok(())
    }

    /// Counts the bytes of every file in `inputs`, one worker per file.
    ///
    /// # Errors
    ///
    /// - [`CountError::NoInputs`] or [`CountError::TooManyInputs`] for a bad
    ///   input list.
    /// - [`CountError::InputMissing`] if any input does not exist; no worker
    ///   is started in that case.
    /// - Whatever the strategy reports as fatal.
    pub fn run<P: AsRef<Path>>(&mut self, inputs: &[P]) -> Result<Report> {
        self.check_count(inputs.len())?;

        let sources = inputs
            .iter()
            .map(InputSource::resolve)
            .collect::<Result<Vec<_>>>()?;
        let mut streams = Vec::with_capacity(sources.len());
        for source in &sources {
            streams.push((source.name(), source.open()?));
        }

        self.run_streams(streams)
    }

    /// Counts already opened streams, one worker per `(name, stream)` pair.
    pub fn run_streams(&mut self, inputs: Vec<(String, InputStream)>) -> Result<Report> {
        self.check_count(inputs.len())?;
        let strategy = self.config.strategy().build(&self.config);
        self.run_with(strategy, inputs)
    }

    fn run_with(
        &mut self,
        mut strategy: Box<dyn SyncStrategy>,
        inputs: Vec<(String, InputStream)>,
    ) -> Result<Report> {
        self.phase = Phase::Idle;
        info!(
            "counting {} inputs with the {} strategy",
            inputs.len(),
            strategy.kind()
        );

        let outcome = self.drive(strategy.as_mut(), inputs);
        strategy.teardown();
        self.enter(Phase::Released);

        if let Err(e) = &outcome {
            warn!("run failed: {}", e);
        }
        outcome
    }

    fn drive(
        &mut self,
        strategy: &mut dyn SyncStrategy,
        inputs: Vec<(String, InputStream)>,
    ) -> Result<Report> {
        strategy.setup(inputs.len())?;

        self.enter(Phase::SpawningWorkers);
        let mut skipped = Vec::new();
        for (index, (source, stream)) in inputs.into_iter().enumerate() {
            let descriptor = WorkerDescriptor::new(index, source);
            match strategy.spawn(descriptor.clone(), stream) {
                Ok(()) => {}
                Err(e @ CountError::Spawn { .. }) => {
                    warn!("skipping {}: {}", descriptor, e);
                    skipped.push(WorkerFailure::new(&descriptor, e));
                }
                Err(e) => return Err(e),
            }
        }

        self.enter(Phase::AwaitingCompletion);
        let completion = strategy.await_completion()?;

        self.enter(Phase::Aggregating);
        let aggregate = strategy.aggregate()?;

        self.enter(Phase::Reporting);
        let report = Report {
            strategy: strategy.kind(),
            table: aggregate.table,
            workers: completion.summaries,
            subtotals: aggregate.subtotals,
            failed: completion.failures,
            skipped,
        };
        info!(
            "{} bytes counted by {} workers ({} failed, {} skipped)",
            report.total(),
            report.workers.len(),
            report.failed.len(),
            report.skipped.len()
        );
        Ok(report)
    }
}

/// Counts the bytes of `inputs` with `strategy` and returns the final table.
///
/// # Examples
///
/// ```rust,no_run
/// use bytetally::strategy::StrategyKind;
///
/// let table = bytetally::run(&["notes.txt"], StrategyKind::Mutex).unwrap();
/// println!("{} bytes", table.total());
/// ```
pub fn run<P: AsRef<Path>>(inputs: &[P], strategy: StrategyKind) -> Result<CounterTable> {
    Coordinator::new(RunConfig::new(strategy))
        .run(inputs)
        .map(|report| report.table)
}
