//! Message types for worker/supervisor communication
//!
//! A worker and its supervisor talk over a duplex link made of two bounded
//! `tokio::sync::mpsc` channels of capacity 1. For the scan pair every
//! `Counts`/`TrackingUpdate` the worker sends is answered by exactly one
//! `ControlUpdate`, and the worker does not send again until it has consumed
//! that reply. The supervisor's copy of the threshold therefore reaches the
//! worker on every exchange without any shared memory.
//!
//! ```text
//! worker --PointResult--> supervisor --ScanEvent--> presentation
//!        <-ControlUpdate-
//! ```

use crate::error::{ScanError, ScanResult};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Why a worker stopped before exhausting its sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The operator asked to stop.
    Requested,
    /// Initialization, device or channel failure.
    Fault(String),
}

/// Worker → supervisor message of the scan pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointResult {
    /// One acquired sweep point; expects a [`ControlUpdate`] reply.
    Counts {
        /// Signal counts
        signal: i64,
        /// Reference counts
        reference: i64,
    },
    /// One tracking sample; expects a [`ControlUpdate`] reply.
    TrackingUpdate {
        /// Trial counts at the candidate
        counts: i64,
    },
    /// Run ended early. Terminal.
    Aborted {
        /// Operator stop or fault
        reason: AbortReason,
    },
    /// Every point of every average acquired. Terminal.
    Completed,
}

impl PointResult {
    /// Terminal messages end the exchange and expect no reply.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PointResult::Aborted { .. } | PointResult::Completed)
    }
}

/// Supervisor → worker reply carrying the latest operator intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlUpdate {
    /// Reference counts below this trigger tracking
    pub threshold: i64,
    /// `false` asks the worker to stop at its next check
    pub continue_running: bool,
}

impl ControlUpdate {
    /// Keep running with `threshold`.
    pub fn new(threshold: i64) -> Self {
        Self {
            threshold,
            continue_running: true,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalReason {
    /// The sweep ran to the end
    Completed,
    /// The operator stopped the run
    Aborted,
    /// Initialization, device or channel failure
    Error(String),
}

/// Event delivered to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Acquired sweep point
    Data {
        /// Signal counts
        signal: i64,
        /// Reference counts
        reference: i64,
    },
    /// Tracking sample
    Tracking {
        /// Trial counts at the candidate
        counts: i64,
    },
    /// Human-readable status line
    Status(String),
    /// Last event of a run
    Terminal(TerminalReason),
}

/// Watchdog worker → supervisor report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogReport {
    /// A re-centering pass is starting.
    Tracking,
    /// Current peak counts.
    Counts(i64),
    /// The worker failed. Terminal.
    Aborted {
        /// Why it stopped
        reason: AbortReason,
    },
}

/// Creates the two ends of a duplex link.
pub fn duplex<Up, Down>() -> (WorkerEnd<Up, Down>, SupervisorEnd<Up, Down>) {
    let (up_tx, up_rx) = mpsc::channel(1);
    let (down_tx, down_rx) = mpsc::channel(1);
    (
        WorkerEnd {
            tx: up_tx,
            rx: down_rx,
        },
        SupervisorEnd {
            rx: up_rx,
            tx: down_tx,
        },
    )
}

/// Worker side: blocking send and receive.
#[derive(Debug)]
pub struct WorkerEnd<Up, Down> {
    tx: mpsc::Sender<Up>,
    rx: mpsc::Receiver<Down>,
}

impl<Up, Down> WorkerEnd<Up, Down> {
    /// Sends without waiting for a reply.
    pub async fn send(&self, message: Up) -> ScanResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| ScanError::ChannelClosed("supervisor"))
    }

    /// Sends `message` and waits, without limit, for the reply.
    pub async fn exchange(&mut self, message: Up) -> ScanResult<Down> {
        self.send(message).await?;
        self.rx
            .recv()
            .await
            .ok_or(ScanError::ChannelClosed("supervisor"))
    }

    /// Waits up to `window` for a message. `Ok(None)` means nothing arrived.
    pub async fn poll(&mut self, window: Duration) -> ScanResult<Option<Down>> {
        match timeout(window, self.rx.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(ScanError::ChannelClosed("supervisor")),
            Err(_) => Ok(None),
        }
    }
}

/// What a bounded supervisor-side receive produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Polled<T> {
    /// A message arrived
    Message(T),
    /// Nothing within the window
    Idle,
    /// The worker dropped its end
    Closed,
}

/// Supervisor side: polled receive and reply.
#[derive(Debug)]
pub struct SupervisorEnd<Up, Down> {
    rx: mpsc::Receiver<Up>,
    tx: mpsc::Sender<Down>,
}

impl<Up, Down> SupervisorEnd<Up, Down> {
    /// Waits up to `window` for the next worker message.
    pub async fn poll(&mut self, window: Duration) -> Polled<Up> {
        match timeout(window, self.rx.recv()).await {
            Ok(Some(message)) => Polled::Message(message),
            Ok(None) => Polled::Closed,
            Err(_) => Polled::Idle,
        }
    }

    /// Answers the worker's last message.
    pub async fn reply(&self, message: Down) -> ScanResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| ScanError::ChannelClosed("worker"))
    }
}
