//! Renderers for a finished [`Report`](crate::report::Report).
//!
//! - [`table`] - grid output using the `tabled` crate
//! - [`json`] - JSON output of a [`TallySnapshot`](crate::snapshot::TallySnapshot)
//!
//! The plain listing needs no observer: it is the report's `Display`
//! implementation.
//!
//! # Feature Flags
//!
//! - `table` - Enables the [`table`] module
//! - `json` - Enables the [`json`] module (implies `serde`)

mod error;

pub use error::{ObserverError, Result};

#[cfg(feature = "table")]
pub mod table;

#[cfg(feature = "json")]
pub mod json;
