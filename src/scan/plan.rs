//! Resolution of a run request into the sweep the worker actually performs.

use crate::config::{MicrowaveSource, RunRequest, ScanKind, SourceConfig};
use tracing::debug;

/// Sweep layout for one run.
///
/// When the enabled microwave source sweeps its own frequency, the point count
/// comes from that source and the generator lines are not stepped (`NoScan`).
/// Otherwise the generator sweep defines the point count. The two are never
/// combined.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    /// What the generator lines step through
    pub kind: ScanKind,
    /// Points per average
    pub point_count: u32,
    frequency_sweep: Option<(MicrowaveSource, SourceConfig)>,
}

impl ScanPlan {
    /// Works out point count and sweep owner for `request`.
    pub fn resolve(request: &RunRequest) -> Self {
        match request.microwave.active() {
            Some((source, config)) if config.use_device_scan => {
                if request.scan.kind != ScanKind::NoScan {
                    debug!(
                        requested = ?request.scan.kind,
                        "synthesizer sweeps frequency, generator lines are not stepped"
                    );
                }
                Self {
                    kind: ScanKind::NoScan,
                    point_count: config.step_count,
                    frequency_sweep: Some((source, config.clone())),
                }
            }
            _ => Self {
                kind: request.scan.kind,
                point_count: request.scan.step_count,
                frequency_sweep: None,
            },
        }
    }

    /// Frequency to write before point `index`, when the synthesizer sweeps.
    pub fn frequency_at(&self, index: u32) -> Option<f64> {
        self.frequency_sweep
            .as_ref()
            .map(|(_, source)| source.frequency_at(index))
    }

    /// The source driving a device frequency sweep, if any.
    pub fn sweeping_source(&self) -> Option<MicrowaveSource> {
        self.frequency_sweep.as_ref().map(|(source, _)| *source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AcquisitionParams, MicrowaveConfig, ScanConfig};

    fn request(microwave: MicrowaveConfig) -> RunRequest {
        RunRequest::new(
            ScanConfig {
                kind: ScanKind::Frequency,
                start: 0.0,
                step_size: 50.0,
                step_count: 20,
            },
            microwave,
            AcquisitionParams::default(),
        )
    }

    #[test]
    fn test_generator_sweep_uses_configured_steps() {
        let plan = ScanPlan::resolve(&request(MicrowaveConfig::none()));
        assert_eq!(plan.point_count, 20);
        assert_eq!(plan.kind, ScanKind::Frequency);
        assert_eq!(plan.frequency_at(0), None);
    }

    #[test]
    fn test_enabled_source_without_device_scan_keeps_generator_sweep() {
        let pts = SourceConfig {
            enabled: true,
            ..SourceConfig::disabled()
        };
        let microwave = MicrowaveConfig::new(pts, SourceConfig::disabled()).unwrap();
        let plan = ScanPlan::resolve(&request(microwave));
        assert_eq!(plan.point_count, 20);
        assert_eq!(plan.sweeping_source(), None);
    }

    #[test]
    fn test_device_scan_takes_synthesizer_steps_and_forces_no_scan() {
        let alternate = SourceConfig {
            enabled: true,
            use_device_scan: true,
            start_freq: 2.85e9,
            step_freq: 2.0e6,
            step_count: 7,
            ..SourceConfig::disabled()
        };
        let microwave = MicrowaveConfig::new(SourceConfig::disabled(), alternate).unwrap();
        let plan = ScanPlan::resolve(&request(microwave));

        assert_eq!(plan.point_count, 7);
        assert_eq!(plan.kind, ScanKind::NoScan);
        assert_eq!(plan.sweeping_source(), Some(MicrowaveSource::Alternate));
        assert_eq!(plan.frequency_at(0), Some(2.85e9));
        assert_eq!(plan.frequency_at(3), Some(2.85e9 + 6.0e6));
    }
}
