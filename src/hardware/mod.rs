//! Hardware seam: capability traits and the simulated rig.

pub mod capabilities;
pub mod mock;

pub use capabilities::{
    params, processes, Axis, CounterCard, Devices, Positioner, PositionerHandle, Synthesizer,
    WaveformGenerator,
};
