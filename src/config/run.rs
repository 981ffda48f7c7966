//! Per-run parameters: sweep, microwave sources and acquisition settings.

use crate::error::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};

/// What the generator's sequence lines step through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// Pulse amplitude steps
    Amplitude,
    /// Carrier frequency steps programmed into the generator
    Frequency,
    /// Every line identical; the synthesizer may sweep instead
    NoScan,
}

/// Sweep definition for the generator sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Quantity stepped per line
    pub kind: ScanKind,
    /// Value on the first line
    pub start: f64,
    /// Increment per line
    pub step_size: f64,
    /// Number of sweep points
    pub step_count: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            kind: ScanKind::Amplitude,
            start: 0.0,
            step_size: 50.0,
            step_count: 20,
        }
    }
}

/// One microwave source. Frequencies are in Hz.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Drive this source during the run
    pub enabled: bool,
    /// Output frequency written during initialization
    pub current_freq: f64,
    /// Sweep this source's frequency point by point instead of the generator lines
    pub use_device_scan: bool,
    /// First device-scan frequency
    pub start_freq: f64,
    /// Device-scan increment
    pub step_freq: f64,
    /// Device-scan point count
    pub step_count: u32,
    /// Informational upper bound; the sweep is defined by start, step and count
    pub stop_freq: f64,
}

impl SourceConfig {
    /// A disabled source with the station's usual NV resonance window.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            current_freq: 2.870e9,
            use_device_scan: false,
            start_freq: 2.840e9,
            step_freq: 1.0e6,
            step_count: 100,
            stop_freq: 2.940e9,
        }
    }

    /// Frequency of sweep point `index`.
    pub fn frequency_at(&self, index: u32) -> f64 {
        self.start_freq + self.step_freq * f64::from(index)
    }
}

/// Which physical synthesizer a source entry drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicrowaveSource {
    /// PTS synthesizer on the parallel port
    Pts,
    /// Secondary synthesizer
    Alternate,
}

/// The two interchangeable microwave sources. At most one is enabled.
///
/// Built with [`MicrowaveConfig::new`]; deserialized values must pass
/// [`MicrowaveConfig::validate`] before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicrowaveConfig {
    pts: SourceConfig,
    alternate: SourceConfig,
}

impl MicrowaveConfig {
    /// Rejects configurations that enable both sources.
    pub fn new(pts: SourceConfig, alternate: SourceConfig) -> ScanResult<Self> {
        let config = Self { pts, alternate };
        config.validate()?;
        Ok(config)
    }

    /// Neither source enabled.
    pub fn none() -> Self {
        Self {
            pts: SourceConfig::disabled(),
            alternate: SourceConfig::disabled(),
        }
    }

    /// At most one source enabled, and a device scan needs at least one step.
    pub fn validate(&self) -> ScanResult<()> {
        if self.pts.enabled && self.alternate.enabled {
            return Err(ScanError::Configuration(
                "only one microwave source may be enabled".to_string(),
            ));
        }
        let active = self.active().map(|(_, source)| source);
        if let Some(source) = active {
            if source.use_device_scan && source.step_count == 0 {
                return Err(ScanError::Configuration(
                    "device frequency scan needs at least one step".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The enabled source, if any.
    pub fn active(&self) -> Option<(MicrowaveSource, &SourceConfig)> {
        if self.pts.enabled {
            Some((MicrowaveSource::Pts, &self.pts))
        } else if self.alternate.enabled {
            Some((MicrowaveSource::Alternate, &self.alternate))
        } else {
            None
        }
    }

    /// PTS source entry, enabled or not.
    pub fn pts(&self) -> &SourceConfig {
        &self.pts
    }

    /// Alternate source entry, enabled or not.
    pub fn alternate(&self) -> &SourceConfig {
        &self.alternate
    }
}

/// Counter and averaging parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionParams {
    /// Sequence repetitions per point
    pub sample_count: u32,
    /// Counting gate in ms
    pub count_time_ms: u32,
    /// Counter reset time in ms
    pub reset_time_ms: u32,
    /// Full passes over the sweep
    pub avg_count: u32,
    /// Reference counts below this trigger tracking
    pub threshold: i64,
    /// AOM switching delay in ns
    pub aom_delay: u32,
    /// Microwave switching delay in ns
    pub mw_delay: u32,
}

impl Default for AcquisitionParams {
    fn default() -> Self {
        Self {
            sample_count: 50_000,
            count_time_ms: 300,
            reset_time_ms: 1000,
            avg_count: 10,
            threshold: 50,
            aom_delay: 820,
            mw_delay: 10,
        }
    }
}

/// Everything a single scan needs, moved into the acquisition worker at spawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Generator sweep
    pub scan: ScanConfig,
    /// Synthesizer setup
    pub microwave: MicrowaveConfig,
    /// Counter and averaging
    pub acquisition: AcquisitionParams,
    /// Drive both generator channels (I/Q) instead of one
    #[serde(default)]
    pub iq_enabled: bool,
}

impl RunRequest {
    /// Request with I/Q output off.
    pub fn new(scan: ScanConfig, microwave: MicrowaveConfig, acquisition: AcquisitionParams) -> Self {
        Self {
            scan,
            microwave,
            acquisition,
            iq_enabled: false,
        }
    }

    /// Parses a request from TOML and checks the microwave invariant.
    pub fn from_toml(text: &str) -> ScanResult<Self> {
        let request: RunRequest =
            toml::from_str(text).map_err(|e| ScanError::Configuration(e.to_string()))?;
        request.microwave.validate()?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled() -> SourceConfig {
        SourceConfig {
            enabled: true,
            ..SourceConfig::disabled()
        }
    }

    #[test]
    fn test_both_sources_enabled_is_rejected() {
        let result = MicrowaveConfig::new(enabled(), enabled());
        assert!(matches!(result, Err(ScanError::Configuration(_))));
    }

    #[test]
    fn test_active_source() {
        let config = MicrowaveConfig::new(SourceConfig::disabled(), enabled()).unwrap();
        let (which, _) = config.active().unwrap();
        assert_eq!(which, MicrowaveSource::Alternate);
        assert!(MicrowaveConfig::none().active().is_none());
    }

    #[test]
    fn test_frequency_at() {
        let source = SourceConfig {
            start_freq: 2.8e9,
            step_freq: 2.0e6,
            ..SourceConfig::disabled()
        };
        assert_eq!(source.frequency_at(0), 2.8e9);
        assert_eq!(source.frequency_at(5), 2.81e9);
    }

    #[test]
    fn test_request_from_toml_validates_sources() {
        let text = r#"
[scan]
kind = "frequency"
start = 0.0
step_size = 1.0
step_count = 3

[microwave.pts]
enabled = true
current_freq = 2.87e9
use_device_scan = false
start_freq = 2.84e9
step_freq = 1e6
step_count = 100
stop_freq = 2.94e9

[microwave.alternate]
enabled = true
current_freq = 2.87e9
use_device_scan = false
start_freq = 2.84e9
step_freq = 1e6
step_count = 100
stop_freq = 2.94e9

[acquisition]
sample_count = 1000
count_time_ms = 300
reset_time_ms = 1000
avg_count = 2
threshold = 50
aom_delay = 820
mw_delay = 10
"#;
        let err = RunRequest::from_toml(text).unwrap_err();
        assert!(err.to_string().contains("only one microwave source"));

        let ok = text.replacen("enabled = true", "enabled = false", 1);
        let request = RunRequest::from_toml(&ok).unwrap();
        assert_eq!(request.scan.kind, ScanKind::Frequency);
        assert!(!request.iq_enabled);
    }
}
