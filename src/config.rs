//! Run configuration.
//!
//! A [`RunConfig`] selects the strategy and carries the optional
//! [`IncrementHook`] and [`ResourceLedger`] into the coordinator. It is
//! built with consuming builder methods:
//!
//! ```rust
//! use bytetally::config::RunConfig;
//! use bytetally::strategy::StrategyKind;
//! use std::time::Duration;
//!
//! let config = RunConfig::new(StrategyKind::Mutex)
//!     .with_max_workers(16)
//!     .with_delay(Duration::from_micros(100));
//! assert_eq!(config.max_workers(), 16);
//! ```

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::lifecycle::ResourceLedger;
use crate::strategy::StrategyKind;
use crate::worker::IncrementHook;

/// Upper bound on the number of workers, and so on the number of inputs.
pub const MAX_WORKERS: usize = 256;

/// Everything a coordinator needs besides the inputs.
#[derive(Clone)]
pub struct RunConfig {
    strategy: StrategyKind,
    max_workers: usize,
    hook: Option<IncrementHook>,
    ledger: ResourceLedger,
}

impl RunConfig {
    /// Creates a configuration for `strategy` with default limits and no hook.
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            strategy,
            max_workers: MAX_WORKERS,
            hook: None,
            ledger: ResourceLedger::new(),
        }
    }

    /// Sets the worker limit. Values are clamped to `1..=MAX_WORKERS`.
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.clamp(1, MAX_WORKERS);
        self
    }

    /// Installs a hook run inside every increment.
    pub fn with_hook(mut self, hook: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Installs a hook that sleeps for `delay` inside every increment.
    ///
    /// Widens the window in which a missing lock would lose updates.
    pub fn with_delay(self, delay: Duration) -> Self {
        if delay.is_zero() {
            return self;
        }
        self.with_hook(move |_| thread::sleep(delay))
    }

    /// Shares `ledger` with the run so the caller can inspect it afterwards.
    pub fn with_ledger(mut self, ledger: ResourceLedger) -> Self {
        self.ledger = ledger;
        self
    }

    /// The selected strategy.
    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    /// The worker limit.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// The increment hook, if any.
    pub fn hook(&self) -> Option<&IncrementHook> {
        self.hook.as_ref()
    }

    /// The resource ledger.
    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }
}

impl Debug for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunConfig")
            .field("strategy", &self.strategy)
            .field("max_workers", &self.max_workers)
            .field("hook", &self.hook.is_some())
            .field("ledger", &self.ledger)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_defaults() {
        let config = RunConfig::new(StrategyKind::BarrierMerge);
        assert_eq!(config.strategy(), StrategyKind::BarrierMerge);
        assert_eq!(config.max_workers(), MAX_WORKERS);
        assert!(config.hook().is_none());
    }

    #[test]
    fn test_max_workers_clamped() {
        let config = RunConfig::new(StrategyKind::Mutex).with_max_workers(0);
        assert_eq!(config.max_workers(), 1);
        let config = RunConfig::new(StrategyKind::Mutex).with_max_workers(10_000);
        assert_eq!(config.max_workers(), MAX_WORKERS);
    }

    #[test]
    fn test_hook_is_callable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let config = RunConfig::new(StrategyKind::Mutex).with_hook(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let hook = config.hook().unwrap();
        hook(b'a');
        hook(b'b');
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_delay_installs_nothing() {
        let config = RunConfig::new(StrategyKind::Mutex).with_delay(Duration::ZERO);
        assert!(config.hook().is_none());
        let config = RunConfig::new(StrategyKind::Mutex).with_delay(Duration::from_nanos(1));
        assert!(config.hook().is_some());
    }

    #[test]
    fn test_debug_hides_hook() {
        let config = RunConfig::new(StrategyKind::KeyedSemaphore).with_hook(|_| {});
        let debug_str = format!("{:?}", config);
        assert!(debug_str.contains("KeyedSemaphore"));
        assert!(debug_str.contains("hook: true"));
    }
}
