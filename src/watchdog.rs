//! Idle watchdog.
//!
//! Between scans the sample drifts out of focus. The watchdog samples trial
//! counts every few seconds and, once they fall below a fraction of the last
//! peak, runs a full three-axis tracking pass and takes a new peak.
//!
//! Like a scan it is a worker/supervisor pair on a duplex link. The worker only
//! reports; the one message travelling down is the in-band `false` that stops
//! it.

use crate::config::{Settings, TrackingConfig, WatchdogConfig};
use crate::error::{ScanError, ScanResult};
use crate::hardware::{processes, CounterCard, Devices, Positioner};
use crate::messages::{
    duplex, AbortReason, Polled, ScanEvent, SupervisorEnd, TerminalReason, WatchdogReport,
    WorkerEnd,
};
use crate::tracking::{open_handle, CountSampler, Silent, Tracker, TrialCounter};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Status shown while the watchdog re-centres.
pub const STATUS_TRACKING: &str = "Tracking...";
/// Status shown once the watchdog has stopped.
pub const STATUS_READY: &str = "Ready!";

/// Status line for a fresh peak reading.
pub fn monitoring_status(counts: i64) -> String {
    format!("Monitoring counts...{counts}")
}

/// `counts / peak`, or 0 when there is no usable peak.
pub fn count_ratio(counts: i64, peak: i64) -> f64 {
    if peak <= 0 {
        0.0
    } else {
        counts as f64 / peak as f64
    }
}

type WatchdogLink = WorkerEnd<WatchdogReport, bool>;

struct WatchdogWorker {
    counter: Box<dyn CounterCard>,
    positioner: Box<dyn Positioner>,
    bootloader: PathBuf,
    trial_process: PathBuf,
    tracking: TrackingConfig,
    config: WatchdogConfig,
    link: WatchdogLink,
}

impl WatchdogWorker {
    async fn run(mut self) {
        match self.monitor().await {
            Ok(()) => info!("Watchdog stopped"),
            Err(err) => {
                error!("Watchdog failed: {err}");
                let report = WatchdogReport::Aborted {
                    reason: AbortReason::Fault(err.to_string()),
                };
                if let Err(err) = self.link.send(report).await {
                    warn!("Could not report watchdog failure: {err}");
                }
            }
        }

        if let Err(err) = self.counter.stop_process(processes::TRIAL_COUNTER).await {
            warn!("Failed to stop trial counter: {err:#}");
        }
        if let Err(err) = self.positioner.release_all().await {
            warn!("Failed to release positioner handles: {err:#}");
        }
    }

    async fn monitor(&mut self) -> ScanResult<()> {
        self.counter
            .boot(&self.bootloader)
            .await
            .map_err(ScanError::init)?;
        self.counter
            .load_process(&self.trial_process)
            .await
            .map_err(ScanError::init)?;
        let handle = open_handle(self.positioner.as_ref(), &self.tracking.handle_key).await?;

        let tracker = Tracker::from_config(&self.tracking);
        let sampler = TrialCounter::new(self.counter.as_ref(), self.tracking.count_window);

        sleep(self.config.interval).await;
        let mut peak = sampler.sample().await?;
        info!(peak, "Watchdog peak");
        self.link.send(WatchdogReport::Counts(peak)).await?;
        sleep(self.config.interval).await;

        loop {
            match self.link.poll(self.config.stop_poll).await {
                Ok(Some(false)) | Err(ScanError::ChannelClosed(_)) => return Ok(()),
                Ok(_) => {}
                Err(err) => return Err(err),
            }

            let counts = sampler.sample().await?;
            let ratio = count_ratio(counts, peak);
            debug!(counts, peak, ratio, "Watchdog sample");
            if ratio < self.config.drop_ratio {
                info!(counts, peak, "Counts dropped, re-centring");
                self.link.send(WatchdogReport::Tracking).await?;
                tracker
                    .re_center(
                        self.positioner.as_ref(),
                        handle,
                        &sampler,
                        &self.tracking.watchdog_plan,
                        &mut Silent,
                    )
                    .await?;
                peak = sampler.sample().await?;
                info!(peak, "Watchdog peak");
                self.link.send(WatchdogReport::Counts(peak)).await?;
            }
            sleep(self.config.interval).await;
        }
    }
}

/// Starts idle watchdogs.
pub struct Watchdog;

impl Watchdog {
    /// Spawns the watchdog worker on the counter and positioner of `devices`.
    pub fn start(devices: Devices, settings: Settings) -> WatchdogHandle {
        let (worker_end, supervisor_end) = duplex();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let worker = WatchdogWorker {
            counter: devices.counter,
            positioner: devices.positioner,
            bootloader: settings.devices.bootloader,
            trial_process: settings.devices.trial_process,
            tracking: settings.tracking,
            config: settings.watchdog,
            link: worker_end,
        };
        info!("Starting watchdog");
        let worker_task = tokio::spawn(worker.run());
        let task = tokio::spawn(supervise(
            supervisor_end,
            stop_rx,
            event_tx,
            worker_task,
            settings.supervisor.poll_interval,
        ));

        WatchdogHandle {
            stop: stop_tx,
            events: event_rx,
            task,
        }
    }
}

async fn supervise(
    mut link: SupervisorEnd<WatchdogReport, bool>,
    mut stop: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<ScanEvent>,
    worker: JoinHandle<()>,
    poll_interval: Duration,
) -> TerminalReason {
    let emit = |event: ScanEvent| {
        if events.send(event).is_err() {
            debug!("No listener for watchdog events");
        }
    };
    let mut stopping = false;

    // reports keep being drained after the stop so the worker never blocks on a send
    let mut reason = loop {
        tokio::select! {
            polled = link.poll(poll_interval) => match polled {
                Polled::Message(WatchdogReport::Tracking) => {
                    emit(ScanEvent::Status(STATUS_TRACKING.to_string()));
                }
                Polled::Message(WatchdogReport::Counts(counts)) => {
                    emit(ScanEvent::Status(monitoring_status(counts)));
                }
                Polled::Message(WatchdogReport::Aborted { reason }) => {
                    break match reason {
                        AbortReason::Requested => TerminalReason::Aborted,
                        AbortReason::Fault(message) => TerminalReason::Error(message),
                    };
                }
                Polled::Idle => {}
                Polled::Closed if stopping => break TerminalReason::Completed,
                Polled::Closed => {
                    break TerminalReason::Error("watchdog worker exited without reporting".to_string());
                }
            },
            changed = stop.changed(), if !stopping => {
                if changed.is_err() || *stop.borrow() {
                    info!("Stopping watchdog");
                    stopping = true;
                    if link.reply(false).await.is_err() {
                        debug!("Watchdog worker already gone");
                    }
                }
            }
        }
    };

    if let Err(err) = worker.await {
        error!("Watchdog worker failed: {err}");
        reason = TerminalReason::Error(format!("watchdog worker failed: {err}"));
    }

    emit(ScanEvent::Status(STATUS_READY.to_string()));
    emit(ScanEvent::Terminal(reason.clone()));
    reason
}

/// Operator-side handle to a running watchdog.
#[derive(Debug)]
pub struct WatchdogHandle {
    stop: watch::Sender<bool>,
    events: mpsc::UnboundedReceiver<ScanEvent>,
    task: JoinHandle<TerminalReason>,
}

impl WatchdogHandle {
    /// Asks the worker to stop after its current sample.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Next status or terminal event.
    pub async fn next_event(&mut self) -> Option<ScanEvent> {
        self.events.recv().await
    }

    /// Stops the watchdog and waits for it to release the devices.
    pub async fn shutdown(self) -> TerminalReason {
        self.stop();
        match self.task.await {
            Ok(reason) => reason,
            Err(err) => TerminalReason::Error(format!("watchdog supervisor failed: {err}")),
        }
    }
}
