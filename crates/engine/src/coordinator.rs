//! One reconciliation pass over due candidates.
//!
//! For every due candidate, independently of the others:
//! 1. Claim the pair in the ledger (`record_attempt`); a conflict means some
//!    other pass owns it and the candidate is skipped
//! 2. Route to channels from the user's preference
//! 3. Send on each channel, all within one per-candidate send timeout
//! 4. Record `sent` if any channel succeeded, otherwise `failed`
//!
//! Errors and panics are contained at the candidate boundary.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::{FutureExt, StreamExt, stream};
use serde::Serialize;
use tokio::time::Instant;

use nudge_common::config::AppConfig;
use nudge_common::error::AppError;
use nudge_common::types::{Candidate, Channel, DeliveryOutcome, DeliveryStatus, NewLedgerEntry};
use nudge_notifier::DeliveryClient;

use crate::ledger::LedgerStore;
use crate::router::route_channels;
use crate::selector::CandidateSelector;

/// Tuning knobs for a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    pub send_timeout: Duration,
    pub max_concurrency: usize,
    pub stale_pending_after: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            send_timeout: config.send_timeout(),
            max_concurrency: config.dispatch_max_concurrency,
            stale_pending_after: config.stale_pending_after(),
        }
    }

    /// Reject settings under which a live attempt could be reclaimed mid-send.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.send_timeout.is_zero() {
            return Err(AppError::Config("send timeout must be positive".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(AppError::Config(
                "dispatch concurrency must be at least 1".to_string(),
            ));
        }
        // Headroom past the send budget for the ledger writes around it.
        if self.stale_pending_after <= self.send_timeout * 2 {
            return Err(AppError::Config(format!(
                "stale pending window ({:?}) must exceed twice the send timeout ({:?})",
                self.stale_pending_after, self.send_timeout
            )));
        }
        Ok(())
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(10),
            max_concurrency: 8,
            stale_pending_after: Duration::from_secs(300),
        }
    }
}

/// Counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Candidates handed to dispatch.
    pub selected: usize,
    pub sent: usize,
    pub failed: usize,
    /// Candidates another pass had already claimed.
    pub conflicts: usize,
    /// Candidates abandoned on an error before an outcome was recorded.
    pub errors: usize,
    /// Progress records skipped as malformed.
    pub malformed: usize,
    /// Due pairs held back by frequency settings.
    pub suppressed: usize,
    /// Orphaned pending entries failed at the start of the pass.
    pub reclaimed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateOutcome {
    Sent,
    Failed,
    Conflict,
    Errored,
}

pub struct DispatchCoordinator {
    selector: CandidateSelector,
    ledger: Arc<dyn LedgerStore>,
    clients: BTreeMap<Channel, Arc<dyn DeliveryClient>>,
    settings: DispatchSettings,
}

impl DispatchCoordinator {
    pub fn new(
        selector: CandidateSelector,
        ledger: Arc<dyn LedgerStore>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            selector,
            ledger,
            clients: BTreeMap::new(),
            settings,
        }
    }

    /// Register the client for its channel, replacing any previous one.
    pub fn with_client(mut self, client: Arc<dyn DeliveryClient>) -> Self {
        self.clients.insert(client.channel(), client);
        self
    }

    /// Run one full select → route → send → record cycle.
    ///
    /// Only failure to load the pass inputs is returned as an error; anything
    /// that goes wrong for a single candidate is logged and counted.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<PassReport, AppError> {
        let mut report = PassReport {
            reclaimed: self.reclaim_stale(now).await,
            ..Default::default()
        };

        let mut candidates = self.selector.select_due(now).await?;

        let outcomes: Vec<CandidateOutcome> = stream::iter(candidates.by_ref())
            .map(|candidate| self.dispatch_isolated(candidate, now))
            .buffer_unordered(self.settings.max_concurrency.max(1))
            .collect()
            .await;

        report.selected = outcomes.len();
        report.malformed = candidates.malformed();
        report.suppressed = candidates.suppressed();
        for outcome in outcomes {
            match outcome {
                CandidateOutcome::Sent => report.sent += 1,
                CandidateOutcome::Failed => report.failed += 1,
                CandidateOutcome::Conflict => report.conflicts += 1,
                CandidateOutcome::Errored => report.errors += 1,
            }
        }

        Ok(report)
    }

    async fn reclaim_stale(&self, now: DateTime<Utc>) -> u64 {
        let Some(cutoff) = TimeDelta::from_std(self.settings.stale_pending_after)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return 0;
        };

        match self.ledger.reclaim_stale(cutoff).await {
            Ok(reclaimed) => reclaimed,
            Err(e) => {
                tracing::warn!(error = %e, "Could not reclaim stale ledger entries");
                0
            }
        }
    }

    async fn dispatch_isolated(&self, candidate: Candidate, now: DateTime<Utc>) -> CandidateOutcome {
        let result = AssertUnwindSafe(self.dispatch(&candidate, now))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::error!(
                    user_id = %candidate.user_id,
                    challenge = %candidate.challenge_slug,
                    kind = e.kind(),
                    error = %e,
                    "Reminder dispatch failed"
                );
                CandidateOutcome::Errored
            }
            Err(_) => {
                tracing::error!(
                    user_id = %candidate.user_id,
                    challenge = %candidate.challenge_slug,
                    "Reminder dispatch panicked"
                );
                CandidateOutcome::Errored
            }
        }
    }

    async fn dispatch(
        &self,
        candidate: &Candidate,
        now: DateTime<Utc>,
    ) -> Result<CandidateOutcome, AppError> {
        if let Some(open) = self
            .ledger
            .find_pending(candidate.user_id, &candidate.challenge_slug)
            .await?
            && open.status == DeliveryStatus::Pending
        {
            tracing::debug!(
                user_id = %candidate.user_id,
                challenge = %candidate.challenge_slug,
                entry_id = %open.id,
                "Attempt already in flight"
            );
            return Ok(CandidateOutcome::Conflict);
        }

        let routed: Vec<(Channel, Arc<dyn DeliveryClient>)> = route_channels(&candidate.preference)
            .into_iter()
            .filter_map(|channel| match self.clients.get(&channel) {
                Some(client) => Some((channel, client.clone())),
                None => {
                    tracing::debug!(channel = %channel, "No client configured, channel skipped");
                    None
                }
            })
            .collect();

        let primary = routed
            .iter()
            .map(|(channel, _)| *channel)
            .max()
            .ok_or_else(|| AppError::Internal("no delivery client configured".to_string()))?;

        let claim = NewLedgerEntry {
            user_id: candidate.user_id,
            challenge_slug: candidate.challenge_slug.clone(),
            channel: primary,
            send_at: now,
        };
        let entry_id = match self.ledger.record_attempt(&claim).await {
            Ok(id) => id,
            Err(AppError::Conflict(reason)) => {
                tracing::debug!(
                    user_id = %candidate.user_id,
                    challenge = %candidate.challenge_slug,
                    reason = %reason,
                    "Ledger gate already claimed"
                );
                return Ok(CandidateOutcome::Conflict);
            }
            Err(e) => return Err(e),
        };

        if let Some(prior) = &candidate.prior_entry
            && prior.status == DeliveryStatus::Failed
        {
            tracing::info!(
                user_id = %candidate.user_id,
                challenge = %candidate.challenge_slug,
                previous_error = prior.error_detail.as_deref().unwrap_or("unknown"),
                "Retrying reminder"
            );
        }

        let mut delivered = false;
        let mut external_ref = None;
        let mut failures = Vec::new();
        let deadline = Instant::now() + self.settings.send_timeout;

        for (channel, client) in &routed {
            match self.deliver(client.as_ref(), candidate, deadline).await {
                Ok(reference) => {
                    delivered = true;
                    external_ref = reference.or(external_ref);
                }
                Err(e) => {
                    tracing::warn!(
                        user_id = %candidate.user_id,
                        challenge = %candidate.challenge_slug,
                        channel = %channel,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Channel delivery failed"
                    );
                    failures.push(format!("{}: {}", channel, e));
                }
            }
        }

        let outcome = if delivered {
            DeliveryOutcome::sent(external_ref)
        } else {
            DeliveryOutcome::failed(failures.join("; "))
        };
        self.ledger.mark_outcome(entry_id, &outcome).await?;

        tracing::info!(
            user_id = %candidate.user_id,
            challenge = %candidate.challenge_slug,
            entry_id = %entry_id,
            status = %outcome.status,
            channels = routed.len(),
            "Reminder dispatched"
        );

        Ok(if delivered {
            CandidateOutcome::Sent
        } else {
            CandidateOutcome::Failed
        })
    }

    async fn deliver(
        &self,
        client: &dyn DeliveryClient,
        candidate: &Candidate,
        deadline: Instant,
    ) -> Result<Option<String>, AppError> {
        match tokio::time::timeout_at(deadline, client.send(candidate)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::DeliveryFailed(format!(
                "timed out within the {:?} send budget",
                self.settings.send_timeout
            ))),
        }
    }
}
