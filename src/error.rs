//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle different kinds of errors, from I/O and
//! configuration issues to instrument-specific problems.
//!
//! Only configuration errors raised before the run starts are fatal; every
//! error after `start_control` is recoverable and is surfaced as a device
//! warning or a logged message instead of propagating out of its thread.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Settings file error ({path}): {source}")]
    Settings {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Device '{device}' failed verification: {message}")]
    Verification { device: String, message: String },

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown driver: {0}")]
    UnknownDriver(String),

    #[error("Command parse error: {0}")]
    Command(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    #[error("Networking error: {0}")]
    Net(String),

    #[error("Sequencer error: {0}")]
    Sequencer(String),
}

impl DaqError {
    /// True for errors that must abort startup; everything else is
    /// recoverable once the run is going.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DaqError::Config(_) | DaqError::Settings { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_errors_are_fatal() {
        let err = DaqError::Settings {
            path: "config/settings.toml".into(),
            source: anyhow::anyhow!("missing file"),
        };
        assert!(err.is_fatal());
    }

    #[test]
    fn driver_errors_are_recoverable() {
        assert!(!DaqError::Driver("timeout".into()).is_fatal());
        assert!(!DaqError::Command("bad args".into()).is_fatal());
    }
}
