//! Retry with exponential backoff for unreliable device writes.
//!
//! The synthesizer link drops writes now and then. The recovery policy is: wait
//! 1 s, 2 s, 4 s, 8 s between attempts; once the next wait would exceed the
//! reset threshold (10 s) the connection is re-opened and the wait starts over
//! at 1 s. By default there is no upper bound on attempts, so a dead synthesizer
//! stalls the sweep indefinitely (with a warning per failed attempt). Set
//! `max_attempts` or `max_total_wait` to turn that into an error.

use crate::error::ScanError;
use crate::hardware::Synthesizer;
use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// First wait; doubled after every failure.
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// A wait longer than this triggers a reset and restarts at `initial_delay`.
    #[serde(with = "humantime_serde")]
    pub reset_after: Duration,
    /// Give up after this many attempts. `None` retries forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Give up rather than let the summed waits exceed this. `None` waits forever.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_total_wait: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            reset_after: Duration::from_secs(10),
            max_attempts: None,
            max_total_wait: None,
        }
    }
}

impl BackoffPolicy {
    /// No attempt or wait budget.
    pub fn is_unbounded(&self) -> bool {
        self.max_attempts.is_none() && self.max_total_wait.is_none()
    }
}

/// What a sweep does with a frequency write the backoff helper gave up on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyWriteFailure {
    /// Log and acquire the point at whatever frequency the source is at.
    #[default]
    BestEffort,
    /// End the run with an error.
    AbortRun,
}

/// Outcome of a successful retry sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackoffReport {
    /// Attempts made, including the last one
    pub attempts: u32,
    /// Every wait, in order
    pub delays: Vec<Duration>,
    /// Resets issued
    pub resets: u32,
}

impl BackoffReport {
    /// Sum of all waits.
    pub fn waited(&self) -> Duration {
        self.delays.iter().sum()
    }
}

/// The policy's attempt or wait budget ran out.
#[derive(Debug, Error)]
#[error("gave up after {} attempts ({:?} waited)", .report.attempts, .report.waited())]
pub struct RetryExhausted {
    /// Everything tried before giving up
    pub report: BackoffReport,
}

/// An operation that can be attempted again after failing.
#[async_trait]
pub trait Recoverable<E> {
    /// One try of the operation.
    async fn attempt(&mut self) -> Result<(), E>;
}

/// An object whose connection can be reset.
#[async_trait]
pub trait Resettable<E> {
    /// Re-establish the connection.
    async fn reset(&mut self) -> Result<(), E>;
}

/// Retries `target` according to `policy`.
pub async fn retry_with_backoff<T, E>(
    target: &mut T,
    policy: &BackoffPolicy,
) -> Result<BackoffReport, RetryExhausted>
where
    T: Recoverable<E> + Resettable<E> + Send,
    E: Display,
{
    let mut report = BackoffReport::default();
    let mut delay = policy.initial_delay;

    loop {
        report.attempts += 1;
        match target.attempt().await {
            Ok(()) => return Ok(report),
            Err(err) => warn!(attempt = report.attempts, "attempt failed: {err}"),
        }

        if policy.max_attempts.is_some_and(|max| report.attempts >= max) {
            return Err(RetryExhausted { report });
        }

        if delay > policy.reset_after {
            debug!("backoff exceeded {:?}, resetting", policy.reset_after);
            if let Err(err) = target.reset().await {
                warn!("reset failed: {err}");
            }
            report.resets += 1;
            delay = policy.initial_delay;
        }

        if let Some(budget) = policy.max_total_wait {
            if report.waited() + delay > budget {
                return Err(RetryExhausted { report });
            }
        }

        sleep(delay).await;
        report.delays.push(delay);
        delay *= 2;
    }
}

struct FrequencyWrite<'a> {
    synthesizer: &'a dyn Synthesizer,
    hz: f64,
}

#[async_trait]
impl Recoverable<anyhow::Error> for FrequencyWrite<'_> {
    async fn attempt(&mut self) -> anyhow::Result<()> {
        if self.synthesizer.write_frequency(self.hz).await? {
            Ok(())
        } else {
            Err(anyhow!("synthesizer did not confirm {} Hz", self.hz))
        }
    }
}

#[async_trait]
impl Resettable<anyhow::Error> for FrequencyWrite<'_> {
    async fn reset(&mut self) -> anyhow::Result<()> {
        self.synthesizer.reset().await
    }
}

/// Writes `hz` to the synthesizer, retrying with backoff until it confirms.
///
/// # Errors
///
/// `ScanError::SynthesizerWrite` once a bounded policy is exhausted. With the
/// default unbounded policy this only returns on success.
pub async fn write_frequency_with_retry(
    synthesizer: &dyn Synthesizer,
    hz: f64,
    policy: &BackoffPolicy,
) -> Result<BackoffReport, ScanError> {
    let mut write = FrequencyWrite { synthesizer, hz };
    retry_with_backoff(&mut write, policy)
        .await
        .map_err(|exhausted| ScanError::SynthesizerWrite {
            frequency_hz: hz,
            attempts: exhausted.report.attempts,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{DeviceCall, MockRig};
    use std::cell::RefCell;
    use tokio::time::Instant;
    use tracing_test::traced_test;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().map(|s| Duration::from_secs(*s)).collect()
    }

    struct MockRecoverable {
        attempts: RefCell<u32>,
        succeed_on_attempt: u32,
        resets: u32,
    }

    #[async_trait]
    impl Recoverable<String> for MockRecoverable {
        async fn attempt(&mut self) -> Result<(), String> {
            let mut attempts = self.attempts.borrow_mut();
            *attempts += 1;
            if *attempts >= self.succeed_on_attempt {
                Ok(())
            } else {
                Err("Failed to recover".to_string())
            }
        }
    }

    #[async_trait]
    impl Resettable<String> for MockRecoverable {
        async fn reset(&mut self) -> Result<(), String> {
            self.resets += 1;
            Err("reset refused".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_four_failures_then_success() {
        let rig = MockRig::builder().synth_failures(4).build();
        let synth = rig.synthesizer();
        let start = Instant::now();

        let report = write_frequency_with_retry(&synth, 2.87e9, &BackoffPolicy::default())
            .await
            .unwrap();

        assert_eq!(report.attempts, 5);
        assert_eq!(report.delays, secs(&[1, 2, 4, 8]));
        assert_eq!(report.resets, 0);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
        assert!(logs_contain("attempt failed"));
        assert_eq!(
            rig.count_calls(|c| matches!(c, DeviceCall::SynthReset)).await,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cycle_repeats_while_failing() {
        let rig = MockRig::builder().synth_always_fails().build();
        let synth = rig.synthesizer();
        let policy = BackoffPolicy {
            max_attempts: Some(12),
            ..BackoffPolicy::default()
        };

        let err = write_frequency_with_retry(&synth, 2.87e9, &policy)
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::SynthesizerWrite { attempts: 12, .. }));
        assert_eq!(
            rig.count_calls(|c| matches!(c, DeviceCall::SynthReset)).await,
            2
        );
        assert_eq!(
            rig.count_calls(|c| matches!(c, DeviceCall::SynthWrite { .. }))
                .await,
            12
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_restart_after_reset() {
        let mut target = MockRecoverable {
            attempts: RefCell::new(0),
            succeed_on_attempt: 11,
            resets: 0,
        };
        let report = retry_with_backoff(&mut target, &BackoffPolicy::default())
            .await
            .unwrap();
        assert_eq!(report.delays, secs(&[1, 2, 4, 8, 1, 2, 4, 8, 1, 2]));
        // a failing reset does not stop the retries
        assert_eq!(report.resets, 2);
        assert_eq!(target.resets, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_policy_keeps_retrying() {
        let rig = MockRig::builder().synth_always_fails().build();
        let synth = rig.synthesizer();
        let policy = BackoffPolicy::default();
        assert!(policy.is_unbounded());

        let outcome = tokio::time::timeout(
            Duration::from_secs(600),
            write_frequency_with_retry(&synth, 2.87e9, &policy),
        )
        .await;

        assert!(outcome.is_err(), "unbounded retry returned on its own");
        // 15 s per cycle of 1+2+4+8
        assert!(rig.count_calls(|c| matches!(c, DeviceCall::SynthReset)).await >= 39);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_wait_budget() {
        let mut target = MockRecoverable {
            attempts: RefCell::new(0),
            succeed_on_attempt: u32::MAX,
            resets: 0,
        };
        let policy = BackoffPolicy {
            max_total_wait: Some(Duration::from_secs(10)),
            ..BackoffPolicy::default()
        };
        let err = retry_with_backoff(&mut target, &policy).await.unwrap_err();
        // 1 + 2 + 4 = 7; waiting 8 more would break the 10 s budget
        assert_eq!(err.report.delays, secs(&[1, 2, 4]));
        assert_eq!(err.report.attempts, 4);
    }

    #[tokio::test]
    async fn test_first_attempt_success_does_not_wait() {
        let rig = MockRig::builder().build();
        let synth = rig.synthesizer();
        let report = write_frequency_with_retry(&synth, 1.0e9, &BackoffPolicy::default())
            .await
            .unwrap();
        assert_eq!(report, BackoffReport { attempts: 1, delays: vec![], resets: 0 });
    }
}
