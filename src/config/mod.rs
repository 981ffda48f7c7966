//! Configuration System using Figment
//!
//! Two kinds of configuration exist:
//!
//! - [`Settings`]: station-wide timing, tracking, retry and device paths. Loaded
//!   once per process from a TOML file merged with environment variables.
//! - [`RunRequest`]: the per-run scan, microwave and acquisition parameters. It is
//!   built by the caller (GUI, CLI) and moved into the acquisition worker.
//!
//! # Configuration Sources
//!
//! `Settings` are loaded from (in order of precedence):
//! 1. Environment variables prefixed with `NVSCAN_` (sections separated by `__`)
//! 2. TOML configuration file
//! 3. Built-in defaults
//!
//! ```text
//! NVSCAN_TIMING__SWEEP_SETTLE=150ms
//! NVSCAN_WATCHDOG__DROP_RATIO=0.6
//! NVSCAN_RETRY__MAX_ATTEMPTS=12
//! ```
//!
//! Durations use humantime notation (`"100ms"`, `"1s 10ms"`).

mod run;

pub use run::{
    AcquisitionParams, MicrowaveConfig, MicrowaveSource, RunRequest, ScanConfig, ScanKind,
    SourceConfig,
};

use crate::error_recovery::{BackoffPolicy, FrequencyWriteFailure};
use crate::tracking::{Axis, AxisSweep, TrackPlan};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "NVSCAN_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Parse or merge failure in figment
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Explicitly requested file does not exist
    #[error("Configuration file not found: {}", .0.display())]
    MissingFile(PathBuf),
    /// A value is out of range
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level station configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Hardware settle and poll intervals used by the acquisition worker
    pub timing: TimingConfig,
    /// Hill-climb tracker parameters
    pub tracking: TrackingConfig,
    /// Synthesizer write retry behaviour
    pub retry: RetryConfig,
    /// Counter card boot and process files
    pub devices: DeviceConfig,
    /// Scan supervisor loop
    pub supervisor: SupervisorConfig,
    /// Idle watchdog
    pub watchdog: WatchdogConfig,
}

/// Delays around generator and counter handshakes.
///
/// The defaults are the empirically working values of the station; shorter
/// settle times cause missed jumps or triggers on the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait after the per-average trigger before the first point
    #[serde(with = "humantime_serde")]
    pub sweep_settle: Duration,
    /// Wait after a generator jump before triggering
    #[serde(with = "humantime_serde")]
    pub jump_settle: Duration,
    /// Wait before the second trigger when resuming after tracking
    #[serde(with = "humantime_serde")]
    pub resume_retrigger: Duration,
    /// Wait after restarting the measure process following a tracking pass
    #[serde(with = "humantime_serde")]
    pub tracking_resume: Duration,
    /// Wait after starting generator playback during initialization
    #[serde(with = "humantime_serde")]
    pub generator_start: Duration,
    /// Interval between reads of the counter update flag
    #[serde(with = "humantime_serde")]
    pub flag_poll_interval: Duration,
    /// Reads of the update flag before giving up with a counter timeout
    pub flag_poll_attempts: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            sweep_settle: Duration::from_millis(100),
            jump_settle: Duration::from_millis(5),
            resume_retrigger: Duration::from_millis(100),
            tracking_resume: Duration::from_millis(300),
            generator_start: Duration::from_millis(200),
            flag_poll_interval: Duration::from_millis(100),
            flag_poll_attempts: 600,
        }
    }
}

/// Tracker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Distance from target at which a move counts as settled (µm)
    pub accuracy: f64,
    /// Re-commands of a move before accepting the current position
    pub max_settle_attempts: u32,
    /// Wait between move re-commands
    #[serde(with = "humantime_serde")]
    pub settle_poll: Duration,
    /// Trial counter integration window per sample
    #[serde(with = "humantime_serde")]
    pub count_window: Duration,
    /// Key of the positioner handle to drive
    pub handle_key: String,
    /// Axes swept when tracking interrupts a scan
    pub scan_plan: TrackPlan,
    /// Axes swept by the idle watchdog
    pub watchdog_plan: TrackPlan,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            accuracy: 0.025,
            max_settle_attempts: 20,
            settle_poll: Duration::from_millis(100),
            count_window: Duration::from_millis(1010),
            handle_key: "L".to_string(),
            scan_plan: TrackPlan::new(vec![
                AxisSweep::new(Axis::X, 0.25, 0.05),
                AxisSweep::new(Axis::Y, 0.25, 0.05),
                AxisSweep::new(Axis::Z, 0.5, 0.05),
            ]),
            watchdog_plan: TrackPlan::uniform(&[Axis::X, Axis::Y, Axis::Z], 0.5, 0.05),
        }
    }
}

/// Retry configuration for synthesizer writes during a sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Backoff schedule and budget
    #[serde(flatten)]
    pub backoff: BackoffPolicy,
    /// What a sweep does when the backoff helper gives up
    pub on_exhausted: FrequencyWriteFailure,
}

/// Counter card firmware files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Bootloader image for the counter card
    pub bootloader: PathBuf,
    /// Trigger-synchronized measure protocol (loaded as process 2)
    pub measure_process: PathBuf,
    /// Free-running trial counter (loaded as process 1)
    pub trial_process: PathBuf,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            bootloader: PathBuf::from("ADwin/ADwin11.btl"),
            measure_process: PathBuf::from("ADwin/Measure_Protocol.TB2"),
            trial_process: PathBuf::from("ADwin/TrialCounter.TB1"),
        }
    }
}

/// Scan supervisor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Bounded wait for each worker message
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Idle watchdog configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Pause between count samples
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Fraction of the last peak below which the watchdog re-tracks
    pub drop_ratio: f64,
    /// Window in which the worker looks for a stop message
    #[serde(with = "humantime_serde")]
    pub stop_poll: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            drop_ratio: 0.7,
            stop_poll: Duration::from_millis(10),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from defaults, an optional TOML file and `NVSCAN_` env vars.
    ///
    /// An explicitly named file that does not exist is an error; figment would
    /// otherwise skip it silently.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is missing or malformed, or if
    /// validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::MissingFile(path.to_path_buf()));
            }
            figment = figment.merge(Toml::file(path));
        }
        let settings: Settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timing.flag_poll_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "timing.flag_poll_attempts must be at least 1".to_string(),
            ));
        }

        if !(self.tracking.accuracy > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid tracking.accuracy {}. Must be positive",
                self.tracking.accuracy
            )));
        }
        self.tracking
            .scan_plan
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("tracking.scan_plan: {e}")))?;
        self.tracking
            .watchdog_plan
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("tracking.watchdog_plan: {e}")))?;

        if self.retry.backoff.initial_delay.is_zero() {
            return Err(ConfigError::ValidationError(
                "retry.initial_delay must be non-zero".to_string(),
            ));
        }

        let ratio = self.watchdog.drop_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid watchdog.drop_ratio {ratio}. Must be in (0, 1]"
            )));
        }

        Ok(())
    }

    /// Serializes the merged settings back to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}
