//! Environment overrides. Kept in its own test binary so the variables it sets
//! cannot leak into other settings tests.

use nv_scan::config::Settings;
use std::time::Duration;

#[test]
fn test_env_overrides_file_and_defaults() {
    std::env::set_var("NVSCAN_TIMING__SWEEP_SETTLE", "250ms");
    std::env::set_var("NVSCAN_WATCHDOG__DROP_RATIO", "0.55");
    std::env::set_var("NVSCAN_RETRY__MAX_ATTEMPTS", "12");

    let settings = Settings::load(None).unwrap();
    assert_eq!(settings.timing.sweep_settle, Duration::from_millis(250));
    assert_eq!(settings.watchdog.drop_ratio, 0.55);
    assert_eq!(settings.retry.backoff.max_attempts, Some(12));
    assert_eq!(settings.timing.jump_settle, Duration::from_millis(5));
}
