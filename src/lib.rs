//! # bytetally - Concurrent Byte-Frequency Counting
//!
//! Counts how often each byte value occurs across a set of input streams,
//! one worker per stream, under one of three synchronization disciplines.
//! The three produce the same table for the same inputs; they differ in what
//! they share, how they lock, and what a failing worker does to the run.
//!
//! ## The Problem
//!
//! Many workers incrementing one table lose updates unless every
//! read-modify-write of a counter is exclusive. Where that exclusivity comes
//! from decides the cost of an increment:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         Where the lock lives                             │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  keyed-semaphore   one semaphore per key     same key: serialized        │
//! │                    processes + shared mmap   other keys: in parallel     │
//! │                                                                          │
//! │  mutex             one lock for the table    every increment serialized  │
//! │                    threads                                               │
//! │                                                                          │
//! │  barrier-merge     no lock while counting    one merge after a barrier   │
//! │                    threads + private tables                              │
//! │                                                                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Strategies
//!
//! | Strategy | Keys counted | Worker failure |
//! |----------|--------------|----------------|
//! | [`KeyedSemaphore`](strategy::StrategyKind::KeyedSemaphore) | bytes 0..=126 | aborts the run, remaining workers are killed |
//! | [`Mutex`](strategy::StrategyKind::Mutex) | all 256 | only that worker stops; listed in the report |
//! | [`BarrierMerge`](strategy::StrategyKind::BarrierMerge) | all 256 | poisons the barrier and aborts the run |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bytetally::strategy::StrategyKind;
//!
//! let table = bytetally::run(&["access.log", "error.log"], StrategyKind::BarrierMerge)?;
//! println!("{} bytes, {} newlines", table.total(), table.get(b'\n'));
//! # Ok::<(), bytetally::error::CountError>(())
//! ```
//!
//! With a configuration and the full [`Report`](report::Report):
//!
//! ```rust,no_run
//! use bytetally::config::RunConfig;
//! use bytetally::coordinator::Coordinator;
//! use bytetally::strategy::StrategyKind;
//! use std::time::Duration;
//!
//! let config = RunConfig::new(StrategyKind::KeyedSemaphore)
//!     .with_delay(Duration::from_micros(100));
//! let report = Coordinator::new(config).run(&["a.txt", "b.txt"])?;
//! println!("{}", report);
//! # Ok::<(), bytetally::error::CountError>(())
//! ```
//!
//! ## Resource Lifecycle
//!
//! Every shared resource (shared segment, semaphore set, counter mutex,
//! barrier) is registered in a [`ResourceLedger`](lifecycle::ResourceLedger)
//! and released exactly once, on success and on every error path. Pass your
//! own ledger with [`RunConfig::with_ledger`](config::RunConfig::with_ledger)
//! to check.
//!
//! ## Observers
//!
//! | Feature | Module | Description |
//! |---------|--------|-------------|
//! | `table` | [`observers::table`] | Pretty-print counts and workers as ASCII tables |
//! | `json` | [`observers::json`] | Serialize a report to JSON |
//! | `cli` | binary `bytetally` | Command line front end (default) |
//!
//! ## Platform
//!
//! The keyed-semaphore strategy forks worker processes and uses System V
//! semaphores, so the crate targets Unix.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod input;
pub mod ipc;
pub mod lifecycle;
pub mod observers;
pub mod rendezvous;
pub mod report;
pub mod strategy;
pub mod table;
pub mod worker;

#[cfg(feature = "serde")]
pub mod snapshot;

pub use coordinator::run;
