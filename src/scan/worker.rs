//! Acquisition worker.
//!
//! Owns every device for the duration of one run and executes the averaging
//! sweep. It is the only place that touches hardware during a scan; the
//! supervisor sees nothing but the messages on the duplex link.

use crate::config::{MicrowaveSource, RunRequest, Settings};
use crate::error::{ScanError, ScanResult};
use crate::error_recovery::{write_frequency_with_retry, FrequencyWriteFailure};
use crate::hardware::{params, processes, Devices, Synthesizer};
use crate::messages::{AbortReason, ControlUpdate, PointResult, WorkerEnd};
use crate::scan::plan::ScanPlan;
use crate::tracking::{open_handle, SampleSink, Tracker, TrackingSample, TrialCounter};
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Sequence line the generator parks on while the tracker runs.
pub const TRACKING_LINE: u32 = 1;
/// Sequence line of sweep point 0; point `x` lives on `x + FIRST_SCAN_LINE`.
pub const FIRST_SCAN_LINE: u32 = 2;

pub(crate) type ScanLink = WorkerEnd<PointResult, ControlUpdate>;

pub(crate) struct AcquisitionWorker {
    request: RunRequest,
    plan: ScanPlan,
    settings: Settings,
    devices: Devices,
    link: ScanLink,
    control: ControlUpdate,
    cleaned_up: bool,
}

impl AcquisitionWorker {
    pub(crate) fn new(
        request: RunRequest,
        devices: Devices,
        settings: Settings,
        link: ScanLink,
    ) -> Self {
        let plan = ScanPlan::resolve(&request);
        let control = ControlUpdate::new(request.acquisition.threshold);
        Self {
            request,
            plan,
            settings,
            devices,
            link,
            control,
            cleaned_up: false,
        }
    }

    /// Runs the whole scan and reports how it ended. Cleanup always runs.
    pub(crate) async fn run(mut self) {
        let outcome = match self.initialize().await {
            Ok(()) => self.acquire().await,
            Err(err) => {
                error!("Scan initialization failed: {err}");
                Err(err)
            }
        };

        let terminal = match outcome {
            Ok(()) => {
                info!("Scan completed");
                PointResult::Completed
            }
            Err(ScanError::AbortRequested) => {
                info!("Scan aborted by operator");
                PointResult::Aborted {
                    reason: AbortReason::Requested,
                }
            }
            Err(err) => {
                error!("Scan failed: {err}");
                PointResult::Aborted {
                    reason: AbortReason::Fault(err.to_string()),
                }
            }
        };
        if let Err(err) = self.link.send(terminal).await {
            warn!("Could not report scan end: {err}");
        }

        self.cleanup().await;
    }

    async fn initialize(&mut self) -> ScanResult<()> {
        self.request.microwave.validate()?;

        let counter = self.devices.counter.as_ref();
        let generator = self.devices.generator.as_ref();
        let paths = &self.settings.devices;
        let acquisition = &self.request.acquisition;

        counter.boot(&paths.bootloader).await.map_err(ScanError::init)?;
        counter
            .load_process(&paths.measure_process)
            .await
            .map_err(ScanError::init)?;
        counter
            .load_process(&paths.trial_process)
            .await
            .map_err(ScanError::init)?;

        counter
            .set_param(params::COUNT_TIME, i64::from(acquisition.count_time_ms))
            .await
            .map_err(ScanError::init)?;
        counter
            .set_param(params::RESET_TIME, i64::from(acquisition.reset_time_ms))
            .await
            .map_err(ScanError::init)?;
        counter
            .set_param(params::SAMPLES, i64::from(acquisition.sample_count))
            .await
            .map_err(ScanError::init)?;
        counter
            .start_process(processes::MEASURE)
            .await
            .map_err(ScanError::init)?;
        let samples = counter
            .get_param(params::SAMPLES)
            .await
            .map_err(ScanError::init)?;
        info!(samples, "Measure process started");

        generator
            .setup(self.request.iq_enabled)
            .await
            .map_err(ScanError::init)?;
        generator.run().await.map_err(ScanError::init)?;
        sleep(self.settings.timing.generator_start).await;

        match self.request.microwave.active() {
            Some((source, config)) => {
                let synthesizer = self.synthesizer(source)?;
                write_frequency_with_retry(
                    synthesizer,
                    config.current_freq,
                    &self.settings.retry.backoff,
                )
                .await
                .map_err(|e| ScanError::HardwareInit(e.to_string()))?;
                info!(?source, hz = config.current_freq, "Synthesizer set");
            }
            None => warn!("No microwave source enabled, sweeping without synthesizer"),
        }

        info!(
            points = self.plan.point_count,
            averages = self.request.acquisition.avg_count,
            kind = ?self.plan.kind,
            "Scan initialized"
        );
        Ok(())
    }

    async fn acquire(&mut self) -> ScanResult<()> {
        for avg in 0..self.request.acquisition.avg_count {
            debug!(avg, "Starting sweep");
            self.devices.generator.trigger().await?;
            sleep(self.settings.timing.sweep_settle).await;

            for x in 0..self.plan.point_count {
                self.check_continue()?;
                self.set_sweep_frequency(x).await?;

                let (mut signal, mut reference) = self.read_point(x, false).await?;
                while reference < self.control.threshold {
                    self.check_continue()?;
                    info!(
                        x,
                        reference,
                        threshold = self.control.threshold,
                        "Reference below threshold, tracking"
                    );
                    self.track().await?;
                    (signal, reference) = self.read_point(x, true).await?;
                    if signal == 0 {
                        debug!(x, "Empty point after tracking, acquiring again");
                        (signal, reference) = self.read_point(x, true).await?;
                    }
                }

                self.control = self
                    .link
                    .exchange(PointResult::Counts { signal, reference })
                    .await?;
            }
        }
        // a stop sent with the reply to the very last point still counts
        self.check_continue()
    }

    fn check_continue(&self) -> ScanResult<()> {
        if self.control.continue_running {
            Ok(())
        } else {
            Err(ScanError::AbortRequested)
        }
    }

    fn synthesizer(&self, source: MicrowaveSource) -> ScanResult<&dyn Synthesizer> {
        let slot = match source {
            MicrowaveSource::Pts => &self.devices.pts,
            MicrowaveSource::Alternate => &self.devices.alternate,
        };
        slot.as_deref()
            .ok_or_else(|| ScanError::HardwareInit(format!("{source:?} synthesizer not connected")))
    }

    async fn set_sweep_frequency(&self, x: u32) -> ScanResult<()> {
        let (Some(source), Some(hz)) = (self.plan.sweeping_source(), self.plan.frequency_at(x))
        else {
            return Ok(());
        };
        let synthesizer = self.synthesizer(source)?;
        match write_frequency_with_retry(synthesizer, hz, &self.settings.retry.backoff).await {
            Ok(report) => {
                if report.attempts > 1 {
                    info!(x, hz, attempts = report.attempts, "Frequency set after retries");
                }
                Ok(())
            }
            Err(err) => match self.settings.retry.on_exhausted {
                FrequencyWriteFailure::BestEffort => {
                    warn!(x, "{err}; acquiring point anyway");
                    Ok(())
                }
                FrequencyWriteFailure::AbortRun => Err(err),
            },
        }
    }

    /// Acquires one `(signal, reference)` pair for sweep point `x`.
    ///
    /// After a tracking pass (`resumed`) the generator has been parked on the
    /// tracking line, so it is sent back to the point's line and triggered twice.
    async fn read_point(&self, x: u32, resumed: bool) -> ScanResult<(i64, i64)> {
        let counter = self.devices.counter.as_ref();
        let generator = self.devices.generator.as_ref();
        let timing = &self.settings.timing;

        let flag = counter.get_param(params::UPDATE_FLAG).await?;
        if x == 0 || resumed {
            generator.jump(x + FIRST_SCAN_LINE).await?;
            sleep(timing.jump_settle).await;
        }
        generator.trigger().await?;
        if resumed {
            sleep(timing.resume_retrigger).await;
            generator.trigger().await?;
        }

        self.await_update(flag).await?;
        let signal = counter.get_param(params::SIGNAL).await?;
        let reference = counter.get_param(params::REFERENCE).await?;
        debug!(x, signal, reference, "Point acquired");
        Ok((signal, reference))
    }

    async fn await_update(&self, flag: i64) -> ScanResult<()> {
        let counter = self.devices.counter.as_ref();
        let attempts = self.settings.timing.flag_poll_attempts;
        for _ in 0..attempts {
            if counter.get_param(params::UPDATE_FLAG).await? != flag {
                return Ok(());
            }
            sleep(self.settings.timing.flag_poll_interval).await;
        }
        Err(ScanError::CounterTimeout { attempts })
    }

    /// Suspends the measure process and re-centres the positioner.
    async fn track(&mut self) -> ScanResult<()> {
        let Self {
            devices,
            settings,
            link,
            control,
            ..
        } = self;
        let counter = devices.counter.as_ref();
        let generator = devices.generator.as_ref();
        let positioner = devices.positioner.as_ref();

        counter.stop_process(processes::MEASURE).await?;
        generator.jump(TRACKING_LINE).await?;
        sleep(settings.timing.jump_settle).await;
        generator.trigger().await?;

        let handle = open_handle(positioner, &settings.tracking.handle_key).await?;
        let tracker = Tracker::from_config(&settings.tracking);
        let sampler = TrialCounter::new(counter, settings.tracking.count_window);
        let mut sink = StreamingSink { link, control };
        let pass = tracker
            .re_center(
                positioner,
                handle,
                &sampler,
                &settings.tracking.scan_plan,
                &mut sink,
            )
            .await;
        if let Err(err) = positioner.release_all().await {
            warn!("Failed to release positioner handles: {err:#}");
        }
        pass?;

        counter.start_process(processes::MEASURE).await?;
        sleep(settings.timing.tracking_resume).await;
        Ok(())
    }

    /// Stops and releases the devices. Runs at most once per worker.
    async fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        let generator = self.devices.generator.as_ref();
        if let Err(err) = generator.stop().await {
            warn!("Failed to stop generator: {err:#}");
        }
        if let Err(err) = generator.release().await {
            warn!("Failed to release generator: {err:#}");
        }
        if let Err(err) = self.devices.counter.stop_process(processes::MEASURE).await {
            warn!("Failed to stop measure process: {err:#}");
        }
        if let Some((source, _)) = self.request.microwave.active() {
            match self.synthesizer(source) {
                Ok(synthesizer) => {
                    if let Err(err) = synthesizer.release().await {
                        warn!("Failed to release synthesizer: {err:#}");
                    }
                }
                Err(err) => debug!("Skipping synthesizer release: {err}"),
            }
        }
        info!("Scan devices released");
    }
}

/// Streams every tracking sample to the supervisor and takes its reply.
struct StreamingSink<'a> {
    link: &'a mut ScanLink,
    control: &'a mut ControlUpdate,
}

#[async_trait]
impl SampleSink for StreamingSink<'_> {
    async fn record(&mut self, sample: &TrackingSample) -> ScanResult<()> {
        *self.control = self
            .link
            .exchange(PointResult::TrackingUpdate {
                counts: sample.counts,
            })
            .await?;
        if self.control.continue_running {
            Ok(())
        } else {
            Err(ScanError::AbortRequested)
        }
    }
}
