//! Custom error types for the acquisition runtime and the persistor.
//!
//! `DaqError` consolidates every failure the crate can surface, from epoch
//! shape problems to HDF5 I/O at the persistence layer. Errors fall into
//! three broad categories:
//!
//! 1. **Shape errors** - `DuplicateDevice`, `Validation`: caught before an
//!    epoch run starts, surfaced synchronously to the caller.
//! 2. **State errors** - `EmptyEpochQueue`, `State`, `VersionMismatch`,
//!    `FileAlreadyExists`, `FileNotFound`: a lifecycle operation was called
//!    at the wrong time or against the wrong file.
//! 3. **Runtime errors** - `ExceptionalStop`, `Persistence`, `Hdf5`, `Io`:
//!    raised while an epoch is in flight; persistence failures arrive at
//!    the `run_epoch` caller as an aggregate.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition runtime and persistor.
#[derive(Error, Debug)]
pub enum DaqError {
    /// A device with the same name is already registered with the controller.
    #[error("Device '{name}' is already registered")]
    DuplicateDevice { name: String },

    /// A duplicate `(name, manufacturer)` device exists in the experiment.
    #[error("Device '{name}' ({manufacturer}) already exists in the experiment")]
    DuplicatePersistedDevice { name: String, manufacturer: String },

    /// Wire-up or epoch shape validation failed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// `next_epoch` was requested with nothing queued.
    #[error("The epoch queue is empty")]
    EmptyEpochQueue,

    /// The DAQ hardware stopped exceptionally mid-epoch. The epoch was
    /// discarded; the underlying driver error is carried in the message.
    #[error("DAQ stopped exceptionally: {0}")]
    ExceptionalStop(String),

    /// One or more persistence tasks failed during the run.
    ///
    /// Raised at `run_epoch` return after the DAQ has stopped, wrapping
    /// every error the serial persistence worker reported.
    #[error("Epoch persistence failed with {} error(s)", .0.len())]
    Persistence(Vec<DaqError>),

    /// A queued task was cancelled before it started.
    #[error("Task cancelled before it started")]
    Cancelled,

    /// A persistor lifecycle operation was called in the wrong state
    /// (no open group, no open block, end time already stamped, ...).
    #[error("Persistor state error: {0}")]
    State(String),

    /// Deleting the entity would break the containment rules (open
    /// traversal handle or live back-references).
    #[error("Entity cannot be deleted: {0}")]
    DeleteRefused(String),

    /// The file-level `version` attribute does not match this crate's format.
    #[error("File version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    /// Creating a persistor over a path that already exists.
    #[error("File already exists: {}", .0.display())]
    FileAlreadyExists(PathBuf),

    /// Opening a persistor over a path that does not exist.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Text destined for an ASCII-typed field contained non-ASCII bytes.
    #[error("Non-ASCII text cannot be persisted: {0:?}")]
    NonAscii(String),

    /// Error from the HDF5 binary layer.
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::DuplicateDevice {
            name: "amp".to_string(),
        };
        assert_eq!(err.to_string(), "Device 'amp' is already registered");
    }

    #[test]
    fn test_persistence_aggregate_display() {
        let err = DaqError::Persistence(vec![
            DaqError::State("no open block".into()),
            DaqError::Cancelled,
        ]);
        assert!(err.to_string().contains("2 error(s)"));
    }
}
