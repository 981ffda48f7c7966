//! Hardware-synchronized scan: acquisition worker and its supervisor.
//!
//! ```text
//! ScanHandle --watch--> supervisor <--duplex--> worker --> Devices
//!            <-events--
//! ```
//!
//! Start a run with [`ScanSupervisor::start`] and read [`ScanEvent`]s from the
//! returned [`ScanHandle`] until the terminal event arrives.
//!
//! [`ScanEvent`]: crate::messages::ScanEvent

pub mod plan;
pub mod supervisor;
mod worker;

pub use plan::ScanPlan;
pub use supervisor::{ScanHandle, ScanSupervisor};
pub use worker::{FIRST_SCAN_LINE, TRACKING_LINE};
