//! Fixed-size byte counter table.
//!
//! A [`CounterTable`] holds one `u64` counter per key of its [`KeyRange`].
//! The table itself performs no synchronization: the strategies in
//! [`crate::strategy`] decide who may call [`CounterTable::increment`] and
//! when the coordinator may take a [`CounterTable::snapshot`].
//!
//! ```text
//!   KeyRange::Full    [ 0 | 1 | 2 | ... | 126 | 127 | ... | 255 ]   256 slots
//!   KeyRange::Ascii   [ 0 | 1 | 2 | ... | 126 | 127 ]                128 slots
//!                                             ^^^
//!                                             slot exists, never counted
//! ```

use std::fmt::{self, Debug};

/// Number of distinct byte values.
pub const BYTE_KEYS: usize = 256;

/// Highest byte value admitted by [`KeyRange::Ascii`].
pub const ASCII_LAST_COUNTED: u8 = 126;

/// The set of byte values a table counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum KeyRange {
    /// Every byte value, 0 through 255.
    #[default]
    Full,
    /// Bytes 0 through 126. The table has 128 slots; slot 127 stays zero.
    Ascii,
}

impl KeyRange {
    /// Number of slots a table over this range holds.
    pub const fn width(&self) -> usize {
        match self {
            KeyRange::Full => BYTE_KEYS,
            KeyRange::Ascii => 128,
        }
    }

    /// Returns `true` if `key` is counted under this range.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use bytetally::table::KeyRange;
    ///
    /// assert!(KeyRange::Ascii.admits(b'a'));
    /// assert!(!KeyRange::Ascii.admits(127));
    /// assert!(!KeyRange::Ascii.admits(0xff));
    /// assert!(KeyRange::Full.admits(0xff));
    /// ```
    #[inline]
    pub const fn admits(&self, key: u8) -> bool {
        match self {
            KeyRange::Full => true,
            KeyRange::Ascii => key <= ASCII_LAST_COUNTED,
        }
    }
}

/// One non-negative counter per key.
///
/// # Examples
///
/// ```rust
/// use bytetally::table::{CounterTable, KeyRange};
///
/// let mut table = CounterTable::new(KeyRange::Full);
/// for byte in b"aabc" {
///     table.increment(*byte);
/// }
/// assert_eq!(table.get(b'a'), 2);
/// assert_eq!(table.get(b'b'), 1);
/// assert_eq!(table.total(), 4);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct CounterTable {
    range: KeyRange,
    counts: Box<[u64]>,
}

impl CounterTable {
    /// Creates a table with every counter at zero.
    pub fn new(range: KeyRange) -> Self {
        Self {
            range,
            counts: vec![0; range.width()].into_boxed_slice(),
        }
    }

    /// Builds a table from raw counts. Extra counts are dropped, missing ones are zero.
    pub fn from_counts(range: KeyRange, counts: &[u64]) -> Self {
        let mut table = Self::new(range);
        let n = counts.len().min(table.counts.len());
        table.counts[..n].copy_from_slice(&counts[..n]);
        table
    }

    /// The key range this table counts.
    pub fn range(&self) -> KeyRange {
        self.range
    }

    /// Adds one occurrence of `key`.
    ///
    /// Keys outside the range are the caller's responsibility; they are
    /// ignored in release builds.
    #[inline]
    pub fn increment(&mut self, key: u8) {
        debug_assert!(self.range.admits(key), "key {key} outside {:?}", self.range);
        if let Some(slot) = self.counts.get_mut(key as usize) {
            *slot += 1;
        }
    }

    /// Current count for `key`, zero for keys the table does not hold.
    #[inline]
    pub fn get(&self, key: u8) -> u64 {
        self.counts.get(key as usize).copied().unwrap_or(0)
    }

    /// Copy of all counters, indexed by byte value.
    pub fn snapshot(&self) -> Vec<u64> {
        self.counts.to_vec()
    }

    /// Borrowed view of the counters.
    pub fn as_slice(&self) -> &[u64] {
        &self.counts
    }

    /// Sum of all counters.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Adds `other` into `self` slot by slot.
    ///
    /// Slots `other` holds beyond this table's width are dropped.
    pub fn merge(&mut self, other: &CounterTable) {
        for (mine, theirs) in self.counts.iter_mut().zip(other.counts.iter()) {
            *mine += *theirs;
        }
    }

    /// Iterates over `(key, count)` pairs with a non-zero count, in key order.
    pub fn iter_nonzero(&self) -> impl Iterator<Item = (u8, u64)> + '_ {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count != 0)
            .map(|(key, count)| (key as u8, *count))
    }

    /// Returns `true` if nothing has been counted.
    pub fn is_empty(&self) -> bool {
        self.counts.iter().all(|c| *c == 0)
    }
}

impl Debug for CounterTable {
    /// Formats the table showing non-zero slots only.
    ///
    /// Output format: `CounterTable(Full){ [97]:2 [98]:1 }`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CounterTable({:?}){{", self.range)?;
        for (key, count) in self.iter_nonzero() {
            write!(f, " [{key}]:{count}")?;
        }
        write!(f, " }}")
    }
}
