//! Custom error types for the scan controller.
//!
//! `ScanError` is the single error type that crosses module boundaries inside
//! the crate. Device drivers speak `anyhow::Result` at the capability-trait
//! seam; the worker converts those into `ScanError` with `?` and, at its
//! outermost loop, into a terminal message for the supervisor.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: loading or validating [`Settings`](crate::config::Settings).
//! - **`Configuration`**: semantic problems in a run request (for example two
//!   microwave sources enabled at once).
//! - **`HardwareInit`**: the worker could not bring its devices up. Fatal to the
//!   current run only.
//! - **`Device`**: any other driver failure during the run.
//! - **`AbortRequested`**: cooperative stop. Not a fault, but it travels the same
//!   termination path.
//! - **`SynthesizerWrite`**: the backoff helper gave up on a frequency write
//!   (only with a bounded [`BackoffPolicy`](crate::error_recovery::BackoffPolicy)).
//! - **`CounterTimeout`**: the counter card's update flag never toggled.
//! - **`ChannelClosed`**: the other half of a duplex link went away.

use crate::config::ConfigError;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Crate-wide error; see the module docs for when each variant is used.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Settings could not be loaded or failed validation
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Inconsistent run request
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Devices could not be brought up
    #[error("Hardware initialization failed: {0}")]
    HardwareInit(String),

    /// Driver failure during the run
    #[error("Device error: {0:#}")]
    Device(#[from] anyhow::Error),

    /// Operator stop
    #[error("Abort requested")]
    AbortRequested,

    /// Backoff budget spent on a frequency write
    #[error("Synthesizer write of {frequency_hz} Hz failed after {attempts} attempts")]
    SynthesizerWrite {
        /// Frequency that was being written
        frequency_hz: f64,
        /// Attempts made
        attempts: u32,
    },

    /// Update flag never toggled
    #[error("Counter update flag unchanged after {attempts} polls")]
    CounterTimeout {
        /// Polls made
        attempts: u32,
    },

    /// The peer dropped its end of the link
    #[error("Channel to {0} closed")]
    ChannelClosed(&'static str),
}

impl ScanError {
    /// Wraps a driver failure that happened while bringing hardware up.
    pub fn init(err: anyhow::Error) -> Self {
        ScanError::HardwareInit(format!("{err:#}"))
    }

    /// True for the cooperative stop, which ends a run as `Aborted` rather than `Error`.
    pub fn is_abort(&self) -> bool {
        matches!(self, ScanError::AbortRequested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScanError::CounterTimeout { attempts: 50 };
        assert_eq!(err.to_string(), "Counter update flag unchanged after 50 polls");
    }

    #[test]
    fn test_init_error_keeps_context_chain() {
        let source = anyhow::anyhow!("bootloader missing").context("counter boot");
        let err = ScanError::init(source);
        assert_eq!(
            err.to_string(),
            "Hardware initialization failed: counter boot: bootloader missing"
        );
        assert!(!err.is_abort());
    }

    #[test]
    fn test_abort_is_not_a_fault() {
        assert!(ScanError::AbortRequested.is_abort());
        assert!(!ScanError::ChannelClosed("supervisor").is_abort());
    }
}
