//! Simulated Rig
//!
//! Mock implementations of every capability trait, sharing one piece of rig
//! state so that the devices interact the way the real station does:
//!
//! - a generator trigger that follows a read of the update flag makes the flag
//!   change on its next read and publishes the next scripted
//!   `(signal, reference)` pair; triggers nobody is waiting on are ignored;
//! - while the trial counter process runs, `params::SIGNAL` returns counts that
//!   depend on where the positioner is (a Gaussian around an optimum), or a
//!   scripted sequence when one is supplied;
//! - the synthesizer can be scripted to fail a number of writes.
//!
//! Every call is appended to a log ([`DeviceCall`]) for assertions.
//! All state sits behind `tokio::sync::Mutex`; no lock is held across an await.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::hardware::capabilities::{
    params, processes, Axis, CounterCard, Devices, Positioner, PositionerHandle, Synthesizer,
    WaveformGenerator,
};

/// One recorded device operation.
///
/// Variants mirror the capability-trait methods they record.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    Boot(PathBuf),
    LoadProcess(PathBuf),
    SetParam(u32, i64),
    StartProcess(u32),
    StopProcess(u32),
    GeneratorSetup(bool),
    Trigger,
    Jump(u32),
    GeneratorRun,
    GeneratorStop,
    GeneratorRelease,
    SynthWrite { hz: f64, accepted: bool },
    SynthReset,
    SynthRelease,
    InitHandles,
    MoveTo(Axis, f64),
    ReleaseAll,
}

#[derive(Debug)]
struct RigState {
    points: VecDeque<(i64, i64)>,
    fallback_point: (i64, i64),
    current_point: (i64, i64),
    update_flag: i64,
    window_open: bool,
    armed: bool,
    stall_update_flag: bool,
    running: HashSet<u32>,
    params: HashMap<u32, i64>,
    boot_error: Option<String>,
    trial_read_error: Option<String>,

    positions: [f64; 3],
    optimum: [f64; 3],
    peak_counts: f64,
    spot_width: f64,
    trial_counts: VecDeque<i64>,
    positioner_stuck: bool,

    synth_accepts_first: u32,
    synth_failures: u32,
    synth_always_fails: bool,

    calls: Vec<DeviceCall>,
}

impl Default for RigState {
    fn default() -> Self {
        Self {
            points: VecDeque::new(),
            fallback_point: (100, 100),
            current_point: (0, 0),
            update_flag: 0,
            window_open: false,
            armed: false,
            stall_update_flag: false,
            running: HashSet::new(),
            params: HashMap::new(),
            boot_error: None,
            trial_read_error: None,
            positions: [0.0; 3],
            optimum: [0.0; 3],
            peak_counts: 1000.0,
            spot_width: 0.2,
            trial_counts: VecDeque::new(),
            positioner_stuck: false,
            synth_accepts_first: 0,
            synth_failures: 0,
            synth_always_fails: false,
            calls: Vec::new(),
        }
    }
}

impl RigState {
    fn trial_counts(&mut self) -> i64 {
        if let Some(counts) = self.trial_counts.pop_front() {
            return counts;
        }
        let distance_sq: f64 = self
            .positions
            .iter()
            .zip(self.optimum.iter())
            .map(|(p, o)| (p - o).powi(2))
            .sum();
        let width_sq = self.spot_width.powi(2);
        (self.peak_counts * (-distance_sq / (2.0 * width_sq)).exp()).round() as i64
    }
}

// =============================================================================
// MockRig - shared state and builder
// =============================================================================

/// Handle to the simulated station. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MockRig {
    state: Arc<Mutex<RigState>>,
}

/// Builder for [`MockRig`].
#[derive(Debug, Default)]
pub struct MockRigBuilder {
    state: RigState,
}

impl MockRigBuilder {
    /// Scripted `(signal, reference)` pairs, one per counter update.
    pub fn points(mut self, points: impl IntoIterator<Item = (i64, i64)>) -> Self {
        self.state.points.extend(points);
        self
    }

    /// Pair returned once the scripted points run out.
    pub fn fallback_point(mut self, signal: i64, reference: i64) -> Self {
        self.state.fallback_point = (signal, reference);
        self
    }

    /// Scripted trial-counter readings; overrides the position model until exhausted.
    pub fn trial_counts(mut self, counts: impl IntoIterator<Item = i64>) -> Self {
        self.state.trial_counts.extend(counts);
        self
    }

    /// Position of maximum fluorescence and its count rate.
    pub fn optimum(mut self, position: [f64; 3], peak_counts: f64) -> Self {
        self.state.optimum = position;
        self.state.peak_counts = peak_counts;
        self
    }

    /// Initial stage position.
    pub fn start_position(mut self, position: [f64; 3]) -> Self {
        self.state.positions = position;
        self
    }

    /// The next `count` synthesizer writes report failure.
    pub fn synth_failures(mut self, count: u32) -> Self {
        self.state.synth_failures = count;
        self
    }

    /// The first `accepted` writes succeed, the `count` after them fail.
    pub fn synth_failures_after(mut self, accepted: u32, count: u32) -> Self {
        self.state.synth_accepts_first = accepted;
        self.state.synth_failures = count;
        self
    }

    /// Every synthesizer write reports failure.
    pub fn synth_always_fails(mut self) -> Self {
        self.state.synth_always_fails = true;
        self
    }

    /// Booting the counter card fails with `message`.
    pub fn boot_error(mut self, message: &str) -> Self {
        self.state.boot_error = Some(message.to_string());
        self
    }

    /// Reading counts from the running trial process fails with `message`.
    pub fn trial_read_error(mut self, message: &str) -> Self {
        self.state.trial_read_error = Some(message.to_string());
        self
    }

    /// The update flag never changes, as with a dead measure process.
    pub fn stall_update_flag(mut self) -> Self {
        self.state.stall_update_flag = true;
        self
    }

    /// Moves are accepted but the stage never leaves its position.
    pub fn stuck_positioner(mut self) -> Self {
        self.state.positioner_stuck = true;
        self
    }

    /// Finishes the rig.
    pub fn build(self) -> MockRig {
        MockRig {
            state: Arc::new(Mutex::new(self.state)),
        }
    }
}

impl MockRig {
    /// Rig with no scripted behaviour.
    pub fn builder() -> MockRigBuilder {
        MockRigBuilder::default()
    }

    /// Counter card view of the rig.
    pub fn counter(&self) -> MockCounter {
        MockCounter {
            state: self.state.clone(),
        }
    }

    /// Generator view of the rig.
    pub fn generator(&self) -> MockGenerator {
        MockGenerator {
            state: self.state.clone(),
        }
    }

    /// Synthesizer view of the rig.
    pub fn synthesizer(&self) -> MockSynthesizer {
        MockSynthesizer {
            state: self.state.clone(),
        }
    }

    /// Positioner view of the rig.
    pub fn positioner(&self) -> MockPositioner {
        MockPositioner {
            state: self.state.clone(),
        }
    }

    /// Device bundle with a mock synthesizer on both source slots.
    pub fn devices(&self) -> Devices {
        Devices {
            counter: Box::new(self.counter()),
            generator: Box::new(self.generator()),
            pts: Some(Box::new(self.synthesizer())),
            alternate: Some(Box::new(self.synthesizer())),
            positioner: Box::new(self.positioner()),
        }
    }

    /// Every call so far, in order.
    pub async fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().await.calls.clone()
    }

    /// Number of recorded calls matching `predicate`.
    pub async fn count_calls(&self, predicate: impl Fn(&DeviceCall) -> bool) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    /// Current stage position on `axis`.
    pub async fn position(&self, axis: Axis) -> f64 {
        self.state.lock().await.positions[axis.index()]
    }

    /// Moves the fluorescence optimum, as drift of the sample would.
    pub async fn set_optimum(&self, position: [f64; 3]) {
        self.state.lock().await.optimum = position;
    }

    /// Whether counter process `process` is running.
    pub async fn is_running(&self, process: u32) -> bool {
        self.state.lock().await.running.contains(&process)
    }
}

// =============================================================================
// Devices
// =============================================================================

/// Simulated counter card.
#[derive(Debug, Clone)]
pub struct MockCounter {
    state: Arc<Mutex<RigState>>,
}

#[async_trait]
impl CounterCard for MockCounter {
    async fn boot(&self, bootloader: &Path) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::Boot(bootloader.to_path_buf()));
        if let Some(message) = &state.boot_error {
            bail!("{message}");
        }
        Ok(())
    }

    async fn load_process(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::LoadProcess(path.to_path_buf()));
        Ok(())
    }

    async fn set_param(&self, id: u32, value: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::SetParam(id, value));
        state.params.insert(id, value);
        Ok(())
    }

    async fn get_param(&self, id: u32) -> Result<i64> {
        let mut state = self.state.lock().await;
        let value = match id {
            params::UPDATE_FLAG => {
                if state.armed && !state.stall_update_flag {
                    state.armed = false;
                    state.window_open = false;
                    state.update_flag += 1;
                    state.current_point = match state.points.pop_front() {
                        Some(point) => point,
                        None => state.fallback_point,
                    };
                } else {
                    state.window_open = true;
                }
                state.update_flag
            }
            params::SIGNAL if state.running.contains(&processes::TRIAL_COUNTER) => {
                if let Some(message) = &state.trial_read_error {
                    bail!("{message}");
                }
                state.trial_counts()
            }
            params::SIGNAL => state.current_point.0,
            params::REFERENCE => state.current_point.1,
            other => state.params.get(&other).copied().unwrap_or(0),
        };
        Ok(value)
    }

    async fn start_process(&self, id: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::StartProcess(id));
        state.running.insert(id);
        Ok(())
    }

    async fn stop_process(&self, id: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::StopProcess(id));
        state.running.remove(&id);
        Ok(())
    }
}

/// Simulated waveform generator.
#[derive(Debug, Clone)]
pub struct MockGenerator {
    state: Arc<Mutex<RigState>>,
}

#[async_trait]
impl WaveformGenerator for MockGenerator {
    async fn setup(&self, iq_enabled: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::GeneratorSetup(iq_enabled));
        Ok(())
    }

    async fn trigger(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::Trigger);
        if state.window_open && state.running.contains(&processes::MEASURE) {
            state.armed = true;
        }
        Ok(())
    }

    async fn jump(&self, line: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::Jump(line));
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::GeneratorRun);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::GeneratorStop);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::GeneratorRelease);
        Ok(())
    }
}

/// Simulated synthesizer with scriptable write failures.
#[derive(Debug, Clone)]
pub struct MockSynthesizer {
    state: Arc<Mutex<RigState>>,
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn write_frequency(&self, hz: f64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let accepted = if state.synth_accepts_first > 0 {
            state.synth_accepts_first -= 1;
            true
        } else if state.synth_failures > 0 {
            state.synth_failures -= 1;
            false
        } else {
            !state.synth_always_fails
        };
        state.calls.push(DeviceCall::SynthWrite { hz, accepted });
        Ok(accepted)
    }

    async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::SynthReset);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::SynthRelease);
        Ok(())
    }
}

/// Simulated three-axis positioner. Moves complete instantly unless stuck.
#[derive(Debug, Clone)]
pub struct MockPositioner {
    state: Arc<Mutex<RigState>>,
}

/// Handle key the simulated positioner reports.
pub const MOCK_HANDLE_KEY: &str = "L";

#[async_trait]
impl Positioner for MockPositioner {
    async fn init_handles(&self) -> Result<HashMap<String, PositionerHandle>> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::InitHandles);
        Ok(HashMap::from([(MOCK_HANDLE_KEY.to_string(), PositionerHandle(1))]))
    }

    async fn read_position(&self, axis: Axis, handle: PositionerHandle) -> Result<f64> {
        if handle != PositionerHandle(1) {
            return Err(anyhow!("unknown positioner handle {:?}", handle));
        }
        Ok(self.state.lock().await.positions[axis.index()])
    }

    async fn move_to(&self, target: f64, axis: Axis, handle: PositionerHandle) -> Result<f64> {
        if handle != PositionerHandle(1) {
            return Err(anyhow!("unknown positioner handle {:?}", handle));
        }
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::MoveTo(axis, target));
        if !state.positioner_stuck {
            state.positions[axis.index()] = target;
        }
        Ok(state.positions[axis.index()])
    }

    async fn release_all(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(DeviceCall::ReleaseAll);
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_publishes_next_point() {
        let rig = MockRig::builder().points([(10, 60), (11, 40)]).build();
        let counter = rig.counter();
        let generator = rig.generator();
        counter.start_process(processes::MEASURE).await.unwrap();

        let flag = counter.get_param(params::UPDATE_FLAG).await.unwrap();
        generator.trigger().await.unwrap();
        assert_ne!(counter.get_param(params::UPDATE_FLAG).await.unwrap(), flag);
        assert_eq!(counter.get_param(params::SIGNAL).await.unwrap(), 10);
        assert_eq!(counter.get_param(params::REFERENCE).await.unwrap(), 60);

        // no trigger, no new point
        let flag = counter.get_param(params::UPDATE_FLAG).await.unwrap();
        assert_eq!(counter.get_param(params::UPDATE_FLAG).await.unwrap(), flag);
    }

    #[tokio::test]
    async fn test_trigger_before_flag_read_is_ignored() {
        let rig = MockRig::builder().points([(10, 60)]).build();
        let counter = rig.counter();
        counter.start_process(processes::MEASURE).await.unwrap();
        rig.generator().trigger().await.unwrap();
        let flag = counter.get_param(params::UPDATE_FLAG).await.unwrap();
        assert_eq!(counter.get_param(params::UPDATE_FLAG).await.unwrap(), flag);
    }

    #[tokio::test]
    async fn test_trigger_without_measure_process_is_ignored() {
        let rig = MockRig::builder().points([(10, 60)]).build();
        let counter = rig.counter();
        let flag = counter.get_param(params::UPDATE_FLAG).await.unwrap();
        rig.generator().trigger().await.unwrap();
        assert_eq!(counter.get_param(params::UPDATE_FLAG).await.unwrap(), flag);
    }

    #[tokio::test]
    async fn test_trial_counts_peak_at_optimum() {
        let rig = MockRig::builder().optimum([0.1, 0.0, 0.0], 500.0).build();
        let counter = rig.counter();
        let positioner = rig.positioner();
        counter.start_process(processes::TRIAL_COUNTER).await.unwrap();

        let off_peak = counter.get_param(params::SIGNAL).await.unwrap();
        positioner
            .move_to(0.1, Axis::X, PositionerHandle(1))
            .await
            .unwrap();
        let on_peak = counter.get_param(params::SIGNAL).await.unwrap();
        assert_eq!(on_peak, 500);
        assert!(off_peak < on_peak);
    }

    #[tokio::test]
    async fn test_synth_failures_then_success() {
        let rig = MockRig::builder().synth_failures(2).build();
        let synth = rig.synthesizer();
        assert!(!synth.write_frequency(1.0).await.unwrap());
        assert!(!synth.write_frequency(1.0).await.unwrap());
        assert!(synth.write_frequency(1.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_synth_failures_after_accepted_writes() {
        let rig = MockRig::builder().synth_failures_after(1, 1).build();
        let synth = rig.synthesizer();
        assert!(synth.write_frequency(1.0).await.unwrap());
        assert!(!synth.write_frequency(2.0).await.unwrap());
        assert!(synth.write_frequency(2.0).await.unwrap());
    }

    #[tokio::test]
    async fn test_stuck_positioner_reports_old_position() {
        let rig = MockRig::builder()
            .start_position([1.0, 2.0, 3.0])
            .stuck_positioner()
            .build();
        let reached = rig
            .positioner()
            .move_to(5.0, Axis::Y, PositionerHandle(1))
            .await
            .unwrap();
        assert_eq!(reached, 2.0);
    }

    #[tokio::test]
    async fn test_boot_error() {
        let rig = MockRig::builder().boot_error("no card").build();
        let result = rig.counter().boot(Path::new("boot.btl")).await;
        assert!(result.is_err());
        assert_eq!(rig.calls().await, vec![DeviceCall::Boot("boot.btl".into())]);
    }
}
