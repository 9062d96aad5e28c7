//! Input sources.
//!
//! Sources are resolved and opened by the coordinator before any worker is
//! spawned, so a missing file aborts the run before a single byte is counted.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::{CountError, Result};

/// A byte stream handed to one worker.
pub type InputStream = Box<dyn Read + Send>;

/// A named input that has been checked for existence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSource {
    path: PathBuf,
}

impl InputSource {
    /// Checks that `path` exists.
    ///
    /// # Errors
    ///
    /// [`CountError::InputMissing`] if nothing exists at `path`.
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CountError::InputMissing {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// The resolved path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Display name used in logs and reports.
    pub fn name(&self) -> String {
        self.path.display().to_string()
    }

    /// Opens the source for reading.
    pub fn open(&self) -> Result<InputStream> {
        match File::open(&self.path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CountError::InputMissing {
                path: self.path.clone(),
            }),
            Err(source) => Err(CountError::Input {
                path: self.path.clone(),
                source,
            }),
        }
    }
}
