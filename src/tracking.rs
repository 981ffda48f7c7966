//! Hill-climb position tracking.
//!
//! Re-centres the positioner on the fluorescence maximum one axis at a time:
//! sweep a line of candidate positions around the current one, sample counts at
//! each, then park at the best candidate. The scan worker runs a pass whenever
//! the reference count drops below threshold; the idle watchdog runs one when
//! counts sag between scans.

use crate::config::TrackingConfig;
use crate::error::{ScanError, ScanResult};
use crate::hardware::{processes, params, CounterCard, Positioner, PositionerHandle};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub use crate::hardware::Axis;

/// Slack on the sweep end point so float rounding does not drop the last candidate.
const CANDIDATE_TOLERANCE: f64 = 1e-9;

/// Upper bound on the candidates of a single axis sweep.
pub const MAX_CANDIDATES: u32 = 10_000;

/// Sweep of one axis: `range` is the full width, centred on the current position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisSweep {
    /// Axis to sweep
    pub axis: Axis,
    /// Full sweep width
    pub range: f64,
    /// Distance between candidates
    pub step: f64,
}

impl AxisSweep {
    /// Sweep of `range` around the current position in steps of `step`.
    pub fn new(axis: Axis, range: f64, step: f64) -> Self {
        Self { axis, range, step }
    }

    /// Candidate positions from `center - range/2` up to `center + range/2`.
    ///
    /// Empty for a non-positive step or a non-finite centre or range; never
    /// longer than [`MAX_CANDIDATES`].
    pub fn candidates(&self, center: f64) -> Vec<f64> {
        if !(self.step > 0.0) || !center.is_finite() || !self.range.is_finite() {
            return Vec::new();
        }
        let start = center - self.range / 2.0;
        let end = center + self.range / 2.0;
        (0..MAX_CANDIDATES)
            .map(|index| start + self.step * f64::from(index))
            .take_while(|position| *position <= end + CANDIDATE_TOLERANCE)
            .collect()
    }

    /// Rejects sweeps that cannot produce a usable candidate line.
    pub fn validate(&self) -> ScanResult<()> {
        if !(self.step > 0.0) {
            return Err(ScanError::Configuration(format!(
                "{} axis step must be positive, got {}",
                self.axis, self.step
            )));
        }
        if !(self.range >= 0.0) || !self.range.is_finite() {
            return Err(ScanError::Configuration(format!(
                "{} axis range must be finite and not negative, got {}",
                self.axis, self.range
            )));
        }
        if self.range / self.step >= f64::from(MAX_CANDIDATES) {
            return Err(ScanError::Configuration(format!(
                "{} axis sweep of {} in steps of {} exceeds {MAX_CANDIDATES} candidates",
                self.axis, self.range, self.step
            )));
        }
        Ok(())
    }
}

/// Ordered list of axis sweeps making up one tracking pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackPlan(Vec<AxisSweep>);

impl TrackPlan {
    /// Plan sweeping `sweeps` in order.
    pub fn new(sweeps: Vec<AxisSweep>) -> Self {
        Self(sweeps)
    }

    /// Same range and step on every axis.
    pub fn uniform(axes: &[Axis], range: f64, step: f64) -> Self {
        Self(
            axes.iter()
                .map(|axis| AxisSweep::new(*axis, range, step))
                .collect(),
        )
    }

    /// Sweeps in execution order.
    pub fn sweeps(&self) -> &[AxisSweep] {
        &self.0
    }

    /// Requires at least one axis and a valid sweep on every axis.
    pub fn validate(&self) -> ScanResult<()> {
        if self.0.is_empty() {
            return Err(ScanError::Configuration(
                "tracking plan has no axes".to_string(),
            ));
        }
        self.0.iter().try_for_each(AxisSweep::validate)
    }
}

/// One `(position, counts)` reading taken during a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackingSample {
    /// Axis being swept
    pub axis: Axis,
    /// Commanded candidate position
    pub position: f64,
    /// Counts sampled there
    pub counts: i64,
}

/// Result of sweeping one axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisOutcome {
    /// Axis that was swept
    pub axis: Axis,
    /// Sample the axis was parked at
    pub best: TrackingSample,
    /// Every sample in sweep order
    pub samples: Vec<TrackingSample>,
}

/// First sample with the highest counts.
pub fn best_sample(samples: &[TrackingSample]) -> Option<&TrackingSample> {
    samples.iter().fold(None, |best, sample| match best {
        Some(current) if current.counts >= sample.counts => Some(current),
        _ => Some(sample),
    })
}

/// Source of photon counts at the current position.
#[async_trait]
pub trait CountSampler: Send + Sync {
    /// Counts over one sampling window.
    async fn sample(&self) -> ScanResult<i64>;
}

/// Samples counts with the counter card's free-running trial process.
pub struct TrialCounter<'a> {
    counter: &'a dyn CounterCard,
    window: Duration,
}

impl<'a> TrialCounter<'a> {
    /// Sampler counting for `window` per sample.
    pub fn new(counter: &'a dyn CounterCard, window: Duration) -> Self {
        Self { counter, window }
    }
}

#[async_trait]
impl CountSampler for TrialCounter<'_> {
    async fn sample(&self) -> ScanResult<i64> {
        self.counter.start_process(processes::TRIAL_COUNTER).await?;
        sleep(self.window).await;
        let counts = self.counter.get_param(params::SIGNAL).await;
        let stopped = self.counter.stop_process(processes::TRIAL_COUNTER).await;
        match (counts, stopped) {
            (Ok(counts), Ok(())) => Ok(counts),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), stopped) => {
                if let Err(stop_err) = stopped {
                    warn!("Failed to stop trial counter: {stop_err:#}");
                }
                Err(err.into())
            }
        }
    }
}

/// Receives every sample as it is taken. Returning an error ends the pass.
#[async_trait]
pub trait SampleSink: Send {
    /// Takes one sample; an error stops the pass.
    async fn record(&mut self, sample: &TrackingSample) -> ScanResult<()>;
}

/// Sink that ignores samples.
#[derive(Debug, Default)]
pub struct Silent;

#[async_trait]
impl SampleSink for Silent {
    async fn record(&mut self, _sample: &TrackingSample) -> ScanResult<()> {
        Ok(())
    }
}

/// Opens the positioner and picks the handle named `key`.
pub async fn open_handle(positioner: &dyn Positioner, key: &str) -> ScanResult<PositionerHandle> {
    let handles = positioner.init_handles().await?;
    handles
        .get(key)
        .copied()
        .ok_or_else(|| ScanError::HardwareInit(format!("no positioner handle '{key}'")))
}

/// Hill-climb tracker.
#[derive(Debug, Clone)]
pub struct Tracker {
    accuracy: f64,
    max_settle_attempts: u32,
    settle_poll: Duration,
}

impl Tracker {
    /// Tracker settling to within `accuracy` in at most `max_settle_attempts` polls.
    pub fn new(accuracy: f64, max_settle_attempts: u32, settle_poll: Duration) -> Self {
        Self {
            accuracy,
            max_settle_attempts,
            settle_poll,
        }
    }

    /// Tracker using the tolerances of `config`.
    pub fn from_config(config: &TrackingConfig) -> Self {
        Self::new(
            config.accuracy,
            config.max_settle_attempts,
            config.settle_poll,
        )
    }

    /// Sweeps every axis of `plan` in order and parks each at its best candidate.
    pub async fn re_center(
        &self,
        positioner: &dyn Positioner,
        handle: PositionerHandle,
        sampler: &dyn CountSampler,
        plan: &TrackPlan,
        sink: &mut dyn SampleSink,
    ) -> ScanResult<Vec<AxisOutcome>> {
        plan.validate()?;
        let mut outcomes = Vec::with_capacity(plan.sweeps().len());
        for sweep in plan.sweeps() {
            outcomes.push(
                self.scan_axis(positioner, handle, sampler, sweep, sink)
                    .await?,
            );
        }
        Ok(outcomes)
    }

    /// Sweeps a single axis.
    pub async fn scan_axis(
        &self,
        positioner: &dyn Positioner,
        handle: PositionerHandle,
        sampler: &dyn CountSampler,
        sweep: &AxisSweep,
        sink: &mut dyn SampleSink,
    ) -> ScanResult<AxisOutcome> {
        sweep.validate()?;
        let center = positioner.read_position(sweep.axis, handle).await?;
        if !center.is_finite() {
            return Err(ScanError::Device(anyhow::anyhow!(
                "{} axis reported position {center}",
                sweep.axis
            )));
        }
        let candidates = sweep.candidates(center);
        debug!(axis = %sweep.axis, center, candidates = candidates.len(), "sweeping axis");

        let mut samples = Vec::with_capacity(candidates.len());
        for position in candidates {
            self.go(positioner, handle, sweep, position).await?;
            let counts = sampler.sample().await?;
            let sample = TrackingSample {
                axis: sweep.axis,
                position,
                counts,
            };
            sink.record(&sample).await?;
            samples.push(sample);
        }

        let best = *best_sample(&samples).ok_or_else(|| {
            ScanError::Configuration(format!("{} axis sweep produced no candidates", sweep.axis))
        })?;
        self.go(positioner, handle, sweep, best.position).await?;
        info!(axis = %sweep.axis, position = best.position, counts = best.counts, "axis re-centred");

        Ok(AxisOutcome {
            axis: sweep.axis,
            best,
            samples,
        })
    }

    /// Moves until within `accuracy` of `target` or the attempt budget is spent.
    async fn go(
        &self,
        positioner: &dyn Positioner,
        handle: PositionerHandle,
        sweep: &AxisSweep,
        target: f64,
    ) -> ScanResult<f64> {
        let mut position = positioner.read_position(sweep.axis, handle).await?;
        let mut attempts = 0;
        while (position - target).abs() > self.accuracy {
            if attempts == self.max_settle_attempts {
                debug!(axis = %sweep.axis, target, position, "move did not settle");
                break;
            }
            position = positioner.move_to(target, sweep.axis, handle).await?;
            sleep(self.settle_poll).await;
            attempts += 1;
        }
        Ok(position)
    }
}
