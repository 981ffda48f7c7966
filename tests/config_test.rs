//! Loading station settings and run requests from files.

use nv_scan::config::{ConfigError, RunRequest, ScanKind, Settings};
use nv_scan::error_recovery::FrequencyWriteFailure;
use nv_scan::scan::ScanPlan;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

#[test]
fn test_shipped_settings_file_loads() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/nv_scan.toml");
    let settings = Settings::load(Some(&path)).unwrap();
    assert_eq!(settings, Settings::default());
}

#[test]
fn test_retry_budget_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[retry]
initial_delay = "500ms"
reset_after = "4s"
max_total_wait = "1m"
on_exhausted = "abort_run"
"#
    )
    .unwrap();

    let settings = Settings::load(Some(file.path())).unwrap();
    assert_eq!(settings.retry.backoff.initial_delay, Duration::from_millis(500));
    assert_eq!(settings.retry.backoff.reset_after, Duration::from_secs(4));
    assert_eq!(
        settings.retry.backoff.max_total_wait,
        Some(Duration::from_secs(60))
    );
    assert!(!settings.retry.backoff.is_unbounded());
    assert_eq!(settings.retry.on_exhausted, FrequencyWriteFailure::AbortRun);
}

#[test]
fn test_malformed_file_is_a_load_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[timing]\nsweep_settle = \"soon\"").unwrap();
    let result = Settings::load(Some(file.path()));
    assert!(matches!(result, Err(ConfigError::LoadError(_))));
}

#[test]
fn test_zero_flag_attempts_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[timing]\nflag_poll_attempts = 0").unwrap();
    let result = Settings::load(Some(file.path()));
    assert!(matches!(result, Err(ConfigError::ValidationError(_))));
}

#[test]
fn test_device_scan_request_from_toml() {
    let text = r#"
iq_enabled = true

[scan]
kind = "frequency"
start = 0.0
step_size = 50.0
step_count = 20

[microwave.pts]
enabled = false
current_freq = 2.87e9
use_device_scan = false
start_freq = 2.84e9
step_freq = 1e6
step_count = 100
stop_freq = 2.94e9

[microwave.alternate]
enabled = true
current_freq = 2.87e9
use_device_scan = true
start_freq = 2.85e9
step_freq = 2e6
step_count = 40
stop_freq = 2.93e9

[acquisition]
sample_count = 50000
count_time_ms = 300
reset_time_ms = 1000
avg_count = 4
threshold = 80
aom_delay = 820
mw_delay = 10
"#;
    let request = RunRequest::from_toml(text).unwrap();
    assert!(request.iq_enabled);
    let plan = ScanPlan::resolve(&request);
    assert_eq!(plan.point_count, 40);
    assert_eq!(plan.kind, ScanKind::NoScan);
}
