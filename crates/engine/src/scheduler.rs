//! Fixed-interval scheduler for reconciliation passes.
//!
//! At most one pass runs per scheduler. A tick that fires while a pass is
//! still in flight is skipped, not queued. Pass errors and panics are logged
//! and the next tick proceeds as usual.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use nudge_common::error::AppError;

use crate::coordinator::{DispatchCoordinator, PassReport};

/// Anything that can execute one reconciliation pass.
#[async_trait]
pub trait PassRunner: Send + Sync + 'static {
    async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport, AppError>;
}

#[async_trait]
impl PassRunner for DispatchCoordinator {
    async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport, AppError> {
        DispatchCoordinator::run_pass(self, now).await
    }
}

/// Clears the in-flight flag when the pass task ends, however it ends.
struct FlightGuard(Arc<AtomicBool>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ReminderScheduler<R: PassRunner> {
    runner: Arc<R>,
    interval: Duration,
    cancel: CancellationToken,
    in_flight: Arc<AtomicBool>,
}

impl<R: PassRunner> ReminderScheduler<R> {
    /// A zero interval is a setup error and keeps the scheduler from starting.
    pub fn new(
        runner: Arc<R>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, AppError> {
        if interval.is_zero() {
            return Err(AppError::Fatal(
                "dispatch interval must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            runner,
            interval,
            cancel,
            in_flight: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Tick until the cancellation token fires, then wait for the in-flight pass.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut current: Option<JoinHandle<()>> = None;

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            "Reminder scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Some(handle) = self.trigger() {
                        current = Some(handle);
                    }
                }
            }
        }

        if let Some(handle) = current
            && !handle.is_finished()
        {
            tracing::info!("Waiting for in-flight pass before shutdown");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "In-flight pass did not finish cleanly");
            }
        }

        tracing::info!("Reminder scheduler stopped");
    }

    fn trigger(&self) -> Option<JoinHandle<()>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Previous pass still running, skipping tick");
            return None;
        }

        let guard = FlightGuard(self.in_flight.clone());
        let runner = self.runner.clone();

        Some(tokio::spawn(async move {
            let _guard = guard;
            let started = Instant::now();
            let now = Utc::now();

            match AssertUnwindSafe(runner.run_pass(now)).catch_unwind().await {
                Ok(Ok(report)) => {
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    if report.selected > 0 || report.malformed > 0 || report.reclaimed > 0 {
                        tracing::info!(
                            selected = report.selected,
                            sent = report.sent,
                            failed = report.failed,
                            conflicts = report.conflicts,
                            errors = report.errors,
                            malformed = report.malformed,
                            suppressed = report.suppressed,
                            reclaimed = report.reclaimed,
                            elapsed_ms,
                            "Reconciliation pass complete"
                        );
                    } else {
                        tracing::debug!(elapsed_ms, "Reconciliation pass found nothing due");
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!(kind = e.kind(), error = %e, "Reconciliation pass failed");
                }
                Err(_) => {
                    tracing::error!("Reconciliation pass panicked");
                }
            }
        }))
    }
}
