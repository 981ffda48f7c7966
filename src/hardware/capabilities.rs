//! Device facade: capability traits for the four instruments a scan drives.
//!
//! Drivers implement these against the real register-level protocols; the scan
//! logic only ever sees the traits. All methods take `&self` so a worker can hold
//! disjoint borrows of several devices at once; drivers keep their own interior
//! mutability.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Counter card parameter registers used by the measure and trial processes.
pub mod params {
    /// Signal counts (measure process) or trial counts (trial process)
    pub const SIGNAL: u32 = 1;
    /// Reference counts
    pub const REFERENCE: u32 = 2;
    /// Counting gate in ms
    pub const COUNT_TIME: u32 = 3;
    /// Reset time in ms
    pub const RESET_TIME: u32 = 4;
    /// Sequence repetitions per point
    pub const SAMPLES: u32 = 5;
    /// Changes value every time the measure process publishes a new point
    pub const UPDATE_FLAG: u32 = 10;
}

/// Counter card process slots.
pub mod processes {
    /// Free-running trial counter used for tracking
    pub const TRIAL_COUNTER: u32 = 1;
    /// Trigger-synchronized measurement
    pub const MEASURE: u32 = 2;
}

/// Counter/timer card running downloadable processes.
#[async_trait]
pub trait CounterCard: Send + Sync {
    /// Boot the card firmware.
    async fn boot(&self, bootloader: &Path) -> Result<()>;
    /// Download a compiled process into its slot.
    async fn load_process(&self, path: &Path) -> Result<()>;
    /// Write a parameter register (see [`params`]).
    async fn set_param(&self, id: u32, value: i64) -> Result<()>;
    /// Read a parameter register.
    async fn get_param(&self, id: u32) -> Result<i64>;
    /// Start a loaded process (see [`processes`]).
    async fn start_process(&self, id: u32) -> Result<()>;
    /// Stop a process; stopping one that is not running is not an error.
    async fn stop_process(&self, id: u32) -> Result<()>;
}

/// Arbitrary waveform generator playing an uploaded sequence.
#[async_trait]
pub trait WaveformGenerator: Send + Sync {
    /// Configure output channels; `iq_enabled` drives both I and Q.
    async fn setup(&self, iq_enabled: bool) -> Result<()>;
    /// Fire one software trigger.
    async fn trigger(&self) -> Result<()>;
    /// Jump playback to a sequence line.
    async fn jump(&self, line: u32) -> Result<()>;
    /// Start playback.
    async fn run(&self) -> Result<()>;
    /// Stop playback.
    async fn stop(&self) -> Result<()>;
    /// Close the session.
    async fn release(&self) -> Result<()>;
}

/// Microwave frequency synthesizer on an unreliable link.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Returns `Ok(false)` when the device did not confirm the new frequency.
    async fn write_frequency(&self, hz: f64) -> Result<bool>;
    /// Re-open the connection.
    async fn reset(&self) -> Result<()>;
    /// Close the connection.
    async fn release(&self) -> Result<()>;
}

/// Positioner axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// Lateral
    X,
    /// Lateral, orthogonal to x
    Y,
    /// Focus
    Z,
}

impl Axis {
    /// Axes in tracking order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Position in `[x, y, z]` arrays.
    pub fn index(self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "x"),
            Axis::Y => write!(f, "y"),
            Axis::Z => write!(f, "z"),
        }
    }
}

/// Opaque handle to an opened positioner controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PositionerHandle(pub i32);

/// Closed-loop piezo positioner.
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Opens all controllers, keyed by serial or label.
    async fn init_handles(&self) -> Result<HashMap<String, PositionerHandle>>;
    /// Current closed-loop position of `axis`.
    async fn read_position(&self, axis: Axis, handle: PositionerHandle) -> Result<f64>;
    /// Commands a move and returns the position read back afterwards.
    async fn move_to(&self, target: f64, axis: Axis, handle: PositionerHandle) -> Result<f64>;
    /// Close every controller opened by `init_handles`.
    async fn release_all(&self) -> Result<()>;
}

/// Every device an acquisition worker owns for the duration of a run.
pub struct Devices {
    /// Counter card
    pub counter: Box<dyn CounterCard>,
    /// Sequence generator
    pub generator: Box<dyn WaveformGenerator>,
    /// PTS synthesizer, if connected
    pub pts: Option<Box<dyn Synthesizer>>,
    /// Alternate synthesizer, if connected
    pub alternate: Option<Box<dyn Synthesizer>>,
    /// Sample positioner
    pub positioner: Box<dyn Positioner>,
}

impl fmt::Debug for Devices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Devices")
            .field("pts", &self.pts.is_some())
            .field("alternate", &self.alternate.is_some())
            .finish_non_exhaustive()
    }
}
