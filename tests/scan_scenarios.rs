//! End-to-end scan runs on the simulated rig.

use nv_scan::config::{
    AcquisitionParams, MicrowaveConfig, RunRequest, ScanConfig, ScanKind, Settings, SourceConfig,
};
use nv_scan::hardware::mock::{DeviceCall, MockRig};
use nv_scan::messages::{ScanEvent, TerminalReason};
use nv_scan::scan::{ScanHandle, ScanSupervisor};

fn request(step_count: u32, avg_count: u32, threshold: i64) -> RunRequest {
    RunRequest::new(
        ScanConfig {
            kind: ScanKind::Amplitude,
            start: 0.0,
            step_size: 50.0,
            step_count,
        },
        MicrowaveConfig::none(),
        AcquisitionParams {
            avg_count,
            threshold,
            ..AcquisitionParams::default()
        },
    )
}

async fn collect(handle: &mut ScanHandle) -> Vec<ScanEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    events
}

fn terminals(events: &[ScanEvent]) -> Vec<&TerminalReason> {
    events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::Terminal(reason) => Some(reason),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_low_reference_is_tracked_and_reacquired() {
    let rig = MockRig::builder()
        .points([(12, 60), (9, 40), (11, 55), (13, 70)])
        .optimum([0.05, -0.05, 0.1], 950.0)
        .build();
    let mut handle = ScanSupervisor::start(request(3, 1, 50), rig.devices(), Settings::default());
    let events = collect(&mut handle).await;

    let data: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ScanEvent::Data { signal, reference } => Some((*signal, *reference)),
            _ => None,
        })
        .collect();
    assert_eq!(data, vec![(12, 60), (11, 55), (13, 70)]);

    // tracking samples arrive between the first and second data points
    let first_tracking = events
        .iter()
        .position(|e| matches!(e, ScanEvent::Tracking { .. }))
        .unwrap();
    let second_data = events
        .iter()
        .position(|e| *e == ScanEvent::Data { signal: 11, reference: 55 })
        .unwrap();
    assert_eq!(first_tracking, 1);
    assert!(events[first_tracking..second_data]
        .iter()
        .all(|e| matches!(e, ScanEvent::Tracking { .. })));

    assert_eq!(terminals(&events), vec![&TerminalReason::Completed]);
    assert_eq!(events.last(), Some(&ScanEvent::Terminal(TerminalReason::Completed)));
}

#[tokio::test(start_paused = true)]
async fn test_stop_sends_no_further_points_and_cleans_up_once() {
    let rig = MockRig::builder().fallback_point(20, 90).build();
    let mut handle = ScanSupervisor::start(request(50, 10, 50), rig.devices(), Settings::default());

    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        if matches!(event, ScanEvent::Data { .. }) && !events.iter().any(|e| matches!(e, ScanEvent::Data { .. })) {
            handle.stop();
        }
        events.push(event);
    }

    let data = events
        .iter()
        .filter(|e| matches!(e, ScanEvent::Data { .. }))
        .count();
    assert!(data <= 2, "got {data} points after stop");
    assert_eq!(terminals(&events), vec![&TerminalReason::Aborted]);
    assert_eq!(handle.wait().await, TerminalReason::Aborted);

    assert_eq!(rig.count_calls(|c| *c == DeviceCall::GeneratorStop).await, 1);
    assert_eq!(rig.count_calls(|c| *c == DeviceCall::GeneratorRelease).await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_initialization_failure_ends_with_error() {
    let rig = MockRig::builder().boot_error("bootloader rejected").build();
    let mut handle = ScanSupervisor::start(request(3, 1, 50), rig.devices(), Settings::default());
    let events = collect(&mut handle).await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        ScanEvent::Terminal(TerminalReason::Error(message)) => {
            assert!(message.contains("bootloader rejected"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    // cleanup still ran
    assert_eq!(rig.count_calls(|c| *c == DeviceCall::GeneratorRelease).await, 1);
}

#[test]
fn test_conflicting_sources_are_rejected() {
    let enabled = SourceConfig {
        enabled: true,
        ..SourceConfig::disabled()
    };
    assert!(MicrowaveConfig::new(enabled.clone(), enabled).is_err());

    let text = r#"
[scan]
kind = "amplitude"
start = 0.0
step_size = 50.0
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
sample_count = 50000
count_time_ms = 300
reset_time_ms = 1000
avg_count = 1
threshold = 50
aom_delay = 820
mw_delay = 10
"#;
    assert!(RunRequest::from_toml(text).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_flaky_synthesizer_delays_but_completes_sweep() {
    let pts = SourceConfig {
        enabled: true,
        use_device_scan: true,
        start_freq: 2.86e9,
        step_freq: 5.0e6,
        step_count: 3,
        ..SourceConfig::disabled()
    };
    let mut run = request(20, 1, 0);
    run.microwave = MicrowaveConfig::new(pts, SourceConfig::disabled()).unwrap();

    // initial write fine, four failures on the first sweep point
    let rig = MockRig::builder().synth_failures_after(1, 4).build();
    let started = tokio::time::Instant::now();
    let mut handle = ScanSupervisor::start(run, rig.devices(), Settings::default());
    let events = collect(&mut handle).await;

    let data = events
        .iter()
        .filter(|e| matches!(e, ScanEvent::Data { .. }))
        .count();
    assert_eq!(data, 3);
    assert_eq!(terminals(&events), vec![&TerminalReason::Completed]);
    assert!(started.elapsed() >= std::time::Duration::from_secs(15));
    assert_eq!(rig.count_calls(|c| *c == DeviceCall::SynthReset).await, 0);
}
