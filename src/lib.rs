//! Core library for the nv_scan station controller.
//!
//! Drives a hardware-synchronized pulsed measurement: an acquisition worker
//! owns the counter card, waveform generator, microwave synthesizer and
//! positioner, steps through a parameter sweep, and re-centres the positioner
//! whenever the reference count drops below threshold. A supervisor relays the
//! worker's results to the presentation layer and the operator's threshold and
//! stop requests back to the worker. An idle watchdog keeps the sample centred
//! between scans.

pub mod config;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod messages;
pub mod scan;
pub mod tracking;
pub mod watchdog;

pub use error::{ScanError, ScanResult};
