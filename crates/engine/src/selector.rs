//! Candidate selection: joins progress, preferences and the ledger.
//!
//! Each pass loads three snapshots:
//! 1. accepted challenges with a `nextCheckpoint` (`challenge-interactions`)
//! 2. the two notification-settings documents per user
//! 3. the latest ledger entry per (user, challenge)
//!
//! and hands back [`DueCandidates`], an iterator that parses and joins one
//! progress record at a time. Records that fail to parse are logged and
//! skipped; they never abort the pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use nudge_common::error::AppError;
use nudge_common::types::{
    Candidate, DeliveryLedgerEntry, DeliveryStatus, Frequency, NotificationPreference,
    ProgressRecord, parse_checkpoint,
};

use crate::ledger::LedgerStore;
use crate::storage::{StorageObject, StorageQuery, StorageReader};

pub const PROGRESS_COLLECTION: &str = "challenge-interactions";
pub const SETTINGS_COLLECTION: &str = "notification-settings";
pub const FREQUENCY_KEY: &str = "notification-freq";
pub const PUSH_SETTINGS_KEY: &str = "onesignal-settings";

/// Minimum gap between two reminders for a user on the `reduced` frequency.
const REDUCED_WINDOW_HOURS: i64 = 24;

type Pair = (Uuid, String);

pub struct CandidateSelector {
    storage: Arc<dyn StorageReader>,
    ledger: Arc<dyn LedgerStore>,
}

impl CandidateSelector {
    pub fn new(storage: Arc<dyn StorageReader>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self { storage, ledger }
    }

    /// Snapshot the inputs and return the candidates due at `now`.
    pub async fn select_due(&self, now: DateTime<Utc>) -> Result<DueCandidates, AppError> {
        let progress = self
            .storage
            .query(
                &StorageQuery::collection(PROGRESS_COLLECTION)
                    .field_eq("type", "accept")
                    .field_present("nextCheckpoint"),
            )
            .await?;
        let frequency = self
            .storage
            .query(&StorageQuery::collection(SETTINGS_COLLECTION).key(FREQUENCY_KEY))
            .await?;
        let push = self
            .storage
            .query(&StorageQuery::collection(SETTINGS_COLLECTION).key(PUSH_SETTINGS_KEY))
            .await?;
        let ledger = self.ledger.latest_entries().await?;

        tracing::debug!(
            progress = progress.len(),
            frequency_docs = frequency.len(),
            push_docs = push.len(),
            ledger_pairs = ledger.len(),
            "Loaded reconciliation inputs"
        );

        Ok(DueCandidates::new(now, progress, frequency, push, ledger))
    }
}

/// Lazily joined candidates for one pass.
pub struct DueCandidates {
    now: DateTime<Utc>,
    progress: std::vec::IntoIter<StorageObject>,
    frequency: HashMap<Uuid, Value>,
    push: HashMap<Uuid, Value>,
    ledger: HashMap<Pair, DeliveryLedgerEntry>,
    /// Latest successful send per user, for `reduced` gating.
    last_sent: HashMap<Uuid, DateTime<Utc>>,
    seen: HashSet<Pair>,
    reduced_served: HashSet<Uuid>,
    malformed: usize,
    suppressed: usize,
}

impl DueCandidates {
    pub fn new(
        now: DateTime<Utc>,
        progress: Vec<StorageObject>,
        frequency: Vec<StorageObject>,
        push: Vec<StorageObject>,
        ledger: Vec<DeliveryLedgerEntry>,
    ) -> Self {
        let mut last_sent: HashMap<Uuid, DateTime<Utc>> = HashMap::new();
        for entry in ledger.iter().filter(|e| e.status == DeliveryStatus::Sent) {
            let latest = last_sent.entry(entry.user_id).or_insert(entry.send_at);
            if entry.send_at > *latest {
                *latest = entry.send_at;
            }
        }

        Self {
            now,
            progress: progress.into_iter(),
            frequency: frequency.into_iter().map(|o| (o.user_id, o.value)).collect(),
            push: push.into_iter().map(|o| (o.user_id, o.value)).collect(),
            ledger: ledger
                .into_iter()
                .map(|e| ((e.user_id, e.challenge_slug.clone()), e))
                .collect(),
            last_sent,
            seen: HashSet::new(),
            reduced_served: HashSet::new(),
            malformed: 0,
            suppressed: 0,
        }
    }

    /// Progress records skipped because a timestamp or document did not parse.
    pub fn malformed(&self) -> usize {
        self.malformed
    }

    /// Due pairs held back by the user's frequency setting.
    pub fn suppressed(&self) -> usize {
        self.suppressed
    }

    fn evaluate(&mut self, record: StorageObject) -> Option<Candidate> {
        let progress = match parse_progress(&record) {
            Ok(progress) => progress,
            Err(e) => {
                tracing::error!(user_id = %record.user_id, key = %record.key, error = %e, "Skipping progress record");
                self.malformed += 1;
                return None;
            }
        };
        let ProgressRecord {
            user_id,
            challenge_slug: slug,
            next_checkpoint: due_at,
        } = progress;

        if due_at > self.now {
            return None;
        }

        let pair = (user_id, slug);
        if self.seen.contains(&pair) {
            return None;
        }

        let prior_entry = self.ledger.get(&pair).cloned();
        if prior_entry.as_ref().is_some_and(|e| e.received) {
            tracing::trace!(user_id = %user_id, challenge = %pair.1, "Reminder already delivered");
            self.seen.insert(pair);
            return None;
        }

        let preference = match NotificationPreference::from_documents(
            user_id,
            self.frequency.get(&user_id),
            self.push.get(&user_id),
        ) {
            Ok(preference) => preference,
            Err(e) => {
                tracing::error!(user_id = %user_id, challenge = %pair.1, error = %e, "Skipping candidate");
                self.malformed += 1;
                return None;
            }
        };

        match preference.frequency {
            Frequency::All => {}
            Frequency::None => {
                tracing::debug!(user_id = %user_id, challenge = %pair.1, "Reminders turned off");
                self.suppressed += 1;
                self.seen.insert(pair);
                return None;
            }
            Frequency::Reduced => {
                let window_start = self.now - Duration::hours(REDUCED_WINDOW_HOURS);
                let recently_sent = self
                    .last_sent
                    .get(&user_id)
                    .is_some_and(|sent| *sent > window_start);
                if recently_sent || self.reduced_served.contains(&user_id) {
                    tracing::debug!(user_id = %user_id, challenge = %pair.1, "Reduced frequency, deferring");
                    self.suppressed += 1;
                    self.seen.insert(pair);
                    return None;
                }
                self.reduced_served.insert(user_id);
            }
        }

        self.seen.insert(pair.clone());
        Some(Candidate {
            user_id,
            challenge_slug: pair.1,
            due_at,
            preference,
            prior_entry,
        })
    }
}

/// Read a `challenge-interactions` document into a progress record.
fn parse_progress(record: &StorageObject) -> Result<ProgressRecord, AppError> {
    let slug = record
        .value
        .get("challengeSlug")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::MalformedInput("progress record has no challengeSlug".to_string()))?;

    let raw_checkpoint = record
        .value
        .get("nextCheckpoint")
        .and_then(Value::as_str)
        .unwrap_or_default();

    Ok(ProgressRecord {
        user_id: record.user_id,
        challenge_slug: slug.to_string(),
        next_checkpoint: parse_checkpoint(raw_checkpoint)?,
    })
}

impl Iterator for DueCandidates {
    type Item = Candidate;

    fn next(&mut self) -> Option<Candidate> {
        loop {
            let record = self.progress.next()?;
            if let Some(candidate) = self.evaluate(record) {
                return Some(candidate);
            }
        }
    }
}
