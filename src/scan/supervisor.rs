//! Scan supervisor and the operator-facing handle.
//!
//! The supervisor task relays worker output as [`ScanEvent`]s and answers every
//! point with the latest operator intent, read from a `watch` channel the
//! [`ScanHandle`] writes to. It never blocks on the worker for longer than one
//! poll interval and always finishes with exactly one [`ScanEvent::Terminal`].
//!
//! The event queue holds a single event and the supervisor only replies once
//! the previous event has been taken, so a stop issued after reading point `k`
//! lets at most point `k + 1` through.

use crate::config::{RunRequest, Settings};
use crate::hardware::Devices;
use crate::messages::{
    duplex, AbortReason, ControlUpdate, Polled, PointResult, ScanEvent, SupervisorEnd,
    TerminalReason,
};
use crate::scan::worker::AcquisitionWorker;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

/// Presentation events buffered ahead of the operator.
const EVENT_BUFFER: usize = 1;

/// Starts scans.
pub struct ScanSupervisor;

impl ScanSupervisor {
    /// Spawns the acquisition worker and its supervisor task.
    ///
    /// The worker takes ownership of `devices` for the length of the run.
    pub fn start(request: RunRequest, devices: Devices, settings: Settings) -> ScanHandle {
        let (worker_end, supervisor_end) = duplex();
        let (control_tx, control_rx) =
            watch::channel(ControlUpdate::new(request.acquisition.threshold));
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let poll_interval = settings.supervisor.poll_interval;

        info!(
            kind = ?request.scan.kind,
            threshold = request.acquisition.threshold,
            "Starting scan"
        );
        let worker = AcquisitionWorker::new(request, devices, settings, worker_end);
        let worker_task = tokio::spawn(worker.run());
        let task = tokio::spawn(supervise(
            supervisor_end,
            control_rx,
            event_tx,
            worker_task,
            poll_interval,
        ));

        ScanHandle {
            control: control_tx,
            events: event_rx,
            task,
        }
    }
}

async fn supervise(
    mut link: SupervisorEnd<PointResult, ControlUpdate>,
    control: watch::Receiver<ControlUpdate>,
    events: mpsc::Sender<ScanEvent>,
    worker: JoinHandle<()>,
    poll_interval: Duration,
) -> TerminalReason {
    let mut reason = loop {
        let event = match link.poll(poll_interval).await {
            Polled::Message(PointResult::Counts { signal, reference }) => {
                ScanEvent::Data { signal, reference }
            }
            Polled::Message(PointResult::TrackingUpdate { counts }) => {
                ScanEvent::Tracking { counts }
            }
            Polled::Message(PointResult::Aborted {
                reason: AbortReason::Requested,
            }) => break TerminalReason::Aborted,
            Polled::Message(PointResult::Aborted {
                reason: AbortReason::Fault(message),
            }) => break TerminalReason::Error(message),
            Polled::Message(PointResult::Completed) => break TerminalReason::Completed,
            Polled::Idle => {
                trace!("Waiting for acquisition worker");
                continue;
            }
            Polled::Closed => {
                break TerminalReason::Error(
                    "acquisition worker exited without reporting".to_string(),
                )
            }
        };
        emit(&events, event).await;

        let update = *control.borrow();
        if let Err(err) = link.reply(update).await {
            break TerminalReason::Error(err.to_string());
        }
    };

    debug!("Joining acquisition worker");
    if let Err(err) = worker.await {
        error!("Acquisition worker failed: {err}");
        reason = TerminalReason::Error(format!("acquisition worker failed: {err}"));
    }

    info!(?reason, "Scan finished");
    emit(&events, ScanEvent::Terminal(reason.clone())).await;
    reason
}

/// Waits for room in the event queue. A dropped receiver only loses the event.
async fn emit(events: &mpsc::Sender<ScanEvent>, event: ScanEvent) {
    if events.send(event).await.is_err() {
        trace!("No listener for scan events");
    }
}

/// Operator-side handle to a running scan.
#[derive(Debug)]
pub struct ScanHandle {
    control: watch::Sender<ControlUpdate>,
    events: mpsc::Receiver<ScanEvent>,
    task: JoinHandle<TerminalReason>,
}

impl ScanHandle {
    /// Sets the reference threshold sent with the next reply.
    pub fn set_threshold(&self, threshold: i64) {
        self.control.send_modify(|update| update.threshold = threshold);
    }

    /// Asks the worker to stop at its next check point.
    pub fn stop(&self) {
        self.control
            .send_modify(|update| update.continue_running = false);
    }

    /// Current operator intent.
    pub fn control(&self) -> ControlUpdate {
        *self.control.borrow()
    }

    /// Next presentation event; `None` once the terminal event has been taken.
    pub async fn next_event(&mut self) -> Option<ScanEvent> {
        self.events.recv().await
    }

    /// Waits for the run to end and returns how it ended.
    ///
    /// Events not yet taken are discarded so the supervisor never waits on them.
    pub async fn wait(self) -> TerminalReason {
        let Self { events, task, .. } = self;
        drop(events);
        match task.await {
            Ok(reason) => reason,
            Err(err) => TerminalReason::Error(format!("scan supervisor failed: {err}")),
        }
    }
}
