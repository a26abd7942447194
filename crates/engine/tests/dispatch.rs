//! End-to-end reconciliation passes over in-memory storage and ledger.
//!
//! Delivery clients are scripted so each test controls which channel
//! succeeds, fails or stalls.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use uuid::Uuid;

use nudge_common::error::AppError;
use nudge_common::types::{Candidate, Channel, DeliveryStatus};
use nudge_engine::selector::{
    FREQUENCY_KEY, PROGRESS_COLLECTION, PUSH_SETTINGS_KEY, SETTINGS_COLLECTION,
};
use nudge_engine::{
    CandidateSelector, DispatchCoordinator, DispatchSettings, LedgerStore, MemoryLedgerStore,
    MemoryStorage,
};
use nudge_notifier::DeliveryClient;

// ============================================================
// Helpers
// ============================================================

/// Delivery client that replays scripted results, then succeeds.
struct ScriptedClient {
    channel: Channel,
    script: Mutex<VecDeque<Result<Option<String>, String>>>,
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<Candidate>>,
}

impl ScriptedClient {
    fn new(channel: Channel) -> Arc<Self> {
        Self::with_delay(channel, Duration::ZERO)
    }

    fn with_delay(channel: Channel, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            channel,
            script: Mutex::new(VecDeque::new()),
            delay,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    async fn push_result(&self, result: Result<Option<String>, String>) {
        self.script.lock().await.push_back(result);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryClient for ScriptedClient {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, candidate: &Candidate) -> Result<Option<String>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().await.push(candidate.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().await.pop_front();
        match next {
            Some(Ok(reference)) => Ok(reference),
            Some(Err(detail)) => Err(AppError::DeliveryFailed(detail)),
            None => Ok(match self.channel {
                Channel::ExternalPush => Some(format!("n-{}", candidate.challenge_slug)),
                Channel::Internal => None,
            }),
        }
    }
}

struct Harness {
    storage: Arc<MemoryStorage>,
    ledger: Arc<MemoryLedgerStore>,
    internal: Arc<ScriptedClient>,
    push: Arc<ScriptedClient>,
}

impl Harness {
    fn new() -> Self {
        Self::with_clients(
            ScriptedClient::new(Channel::Internal),
            ScriptedClient::new(Channel::ExternalPush),
        )
    }

    fn with_clients(internal: Arc<ScriptedClient>, push: Arc<ScriptedClient>) -> Self {
        Self {
            storage: Arc::new(MemoryStorage::new()),
            ledger: Arc::new(MemoryLedgerStore::new()),
            internal,
            push,
        }
    }

    fn coordinator(&self) -> DispatchCoordinator {
        self.coordinator_with(DispatchSettings::default())
    }

    fn coordinator_with(&self, settings: DispatchSettings) -> DispatchCoordinator {
        let selector = CandidateSelector::new(self.storage.clone(), self.ledger.clone());
        DispatchCoordinator::new(selector, self.ledger.clone(), settings)
            .with_client(self.internal.clone())
            .with_client(self.push.clone())
    }

    async fn accept(&self, user: Uuid, slug: &str, checkpoint: &str) {
        self.storage
            .put(
                PROGRESS_COLLECTION,
                &format!("{}-accept", slug),
                user,
                json!({"type": "accept", "challengeSlug": slug, "nextCheckpoint": checkpoint}),
            )
            .await;
    }

    async fn enable_push(&self, user: Uuid, token: &str) {
        self.storage
            .put(
                SETTINGS_COLLECTION,
                PUSH_SETTINGS_KEY,
                user,
                json!({"isPushDisabled": false, "isSubscribed": true, "pushToken": token}),
            )
            .await;
    }

    async fn set_frequency(&self, user: Uuid, frequency: &str) {
        self.storage
            .put(
                SETTINGS_COLLECTION,
                FREQUENCY_KEY,
                user,
                json!({"frequency": frequency}),
            )
            .await;
    }
}

fn pass_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 10, 5, 0).unwrap()
}

// ============================================================
// Scenarios
// ============================================================

#[tokio::test]
async fn test_due_reminder_is_sent_on_both_channels() {
    let h = Harness::new();
    let u1 = Uuid::new_v4();
    h.accept(u1, "c1", "2024-01-01T10:00").await;
    h.set_frequency(u1, "all").await;
    h.enable_push(u1, "tok").await;

    let report = h.coordinator().run_pass(pass_time()).await.unwrap();

    assert_eq!(report.selected, 1);
    assert_eq!(report.sent, 1);
    assert_eq!(h.internal.calls(), 1);
    assert_eq!(h.push.calls(), 1);

    let entries = h.ledger.entries().await;
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.user_id, u1);
    assert_eq!(entry.challenge_slug, "c1");
    assert_eq!(entry.status, DeliveryStatus::Sent);
    assert!(entry.received);
    assert_eq!(entry.channel, Channel::ExternalPush);
    assert_eq!(entry.external_ref.as_deref(), Some("n-c1"));
    assert_eq!(entry.send_at, pass_time());
}

#[tokio::test]
async fn test_failed_delivery_stays_retryable() {
    let h = Harness::new();
    let u1 = Uuid::new_v4();
    h.accept(u1, "c1", "2024-01-01T10:00").await;
    h.enable_push(u1, "tok").await;
    h.internal.push_result(Err("inbox unavailable".into())).await;
    h.push.push_result(Err("OneSignal rejected push (503)".into())).await;

    let coordinator = h.coordinator();
    let first = coordinator.run_pass(pass_time()).await.unwrap();
    assert_eq!(first.failed, 1);

    let entries = h.ledger.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, DeliveryStatus::Failed);
    assert!(!entries[0].received);
    let detail = entries[0].error_detail.as_deref().unwrap();
    assert!(detail.contains("503"));
    assert!(detail.contains("inbox unavailable"));

    // Scripts are exhausted, so the retry succeeds.
    let second = coordinator.run_pass(pass_time()).await.unwrap();
    assert_eq!(second.sent, 1);

    let entries = h.ledger.entries().await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].status, DeliveryStatus::Sent);
    assert!(entries[1].received);
}

#[tokio::test]
async fn test_push_failure_alone_still_counts_as_sent() {
    let h = Harness::new();
    let u1 = Uuid::new_v4();
    h.accept(u1, "c1", "2024-01-01T10:00").await;
    h.enable_push(u1, "tok").await;
    h.push.push_result(Err("OneSignal unreachable".into())).await;

    let report = h.coordinator().run_pass(pass_time()).await.unwrap();

    assert_eq!(report.sent, 1);
    let entry = &h.ledger.entries().await[0];
    assert_eq!(entry.status, DeliveryStatus::Sent);
    assert_eq!(entry.external_ref, None);
}

#[tokio::test]
async fn test_internal_failure_does_not_block_push() {
    let h = Harness::new();
    let u1 = Uuid::new_v4();
    h.accept(u1, "c1", "2024-01-01T10:00").await;
    h.enable_push(u1, "tok").await;
    h.internal.push_result(Err("inbox unavailable".into())).await;

    let report = h.coordinator().run_pass(pass_time()).await.unwrap();

    assert_eq!(report.sent, 1);
    assert_eq!(h.push.calls(), 1);
    assert_eq!(
        h.ledger.entries().await[0].external_ref.as_deref(),
        Some("n-c1")
    );
}

#[tokio::test]
async fn test_second_pass_sends_nothing_new() {
    let h = Harness::new();
    let u1 = Uuid::new_v4();
    let u2 = Uuid::new_v4();
    h.accept(u1, "c1", "2024-01-01T10:00").await;
    h.accept(u2, "c1", "2024-01-01T09:00").await;

    let coordinator = h.coordinator();
    let first = coordinator.run_pass(pass_time()).await.unwrap();
    let second = coordinator.run_pass(pass_time()).await.unwrap();

    assert_eq!(first.sent, 2);
    assert_eq!(second.selected, 0);
    assert_eq!(second.sent, 0);
    assert_eq!(h.internal.calls(), 2);
    assert_eq!(h.ledger.entries().await.len(), 2);
}

#[tokio::test]
async fn test_concurrent_passes_deliver_once() {
    let internal = ScriptedClient::with_delay(Channel::Internal, Duration::from_millis(50));
    let push = ScriptedClient::new(Channel::ExternalPush);
    let h = Harness::with_clients(internal, push);
    let u1 = Uuid::new_v4();
    h.accept(u1, "c1", "2024-01-01T10:00").await;

    // Two independent coordinators stand in for two scheduler instances.
    let a = h.coordinator();
    let b = h.coordinator();
    let (ra, rb) = tokio::join!(a.run_pass(pass_time()), b.run_pass(pass_time()));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.sent + rb.sent, 1);
    assert_eq!(ra.conflicts + rb.conflicts, 1);
    assert_eq!(h.internal.calls(), 1);

    let sent: Vec<_> = h
        .ledger
        .entries()
        .await
        .into_iter()
        .filter(|e| e.status == DeliveryStatus::Sent)
        .collect();
    assert_eq!(sent.len(), 1);
}

#[tokio::test]
async fn test_future_checkpoint_is_not_dispatched_yet() {
    let h = Harness::new();
    let u1 = Uuid::new_v4();
    h.accept(u1, "c1", "2024-01-01T10:30").await;

    let coordinator = h.coordinator();
    let early = coordinator.run_pass(pass_time()).await.unwrap();
    assert_eq!(early.selected, 0);
    assert!(h.ledger.entries().await.is_empty());

    let later = Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap();
    let on_time = coordinator.run_pass(later).await.unwrap();
    assert_eq!(on_time.sent, 1);
}

#[tokio::test]
async fn test_push_disabled_routes_internal_only() {
    let h = Harness::new();
    let u1 = Uuid::new_v4();
    h.accept(u1, "c1", "2024-01-01T10:00").await;
    h.storage
        .put(
            SETTINGS_COLLECTION,
            PUSH_SETTINGS_KEY,
            u1,
            json!({"isPushDisabled": true, "isSubscribed": true, "pushToken": "tok"}),
        )
        .await;

    h.coordinator().run_pass(pass_time()).await.unwrap();

    assert_eq!(h.internal.calls(), 1);
    assert_eq!(h.push.calls(), 0);
    assert_eq!(h.ledger.entries().await[0].channel, Channel::Internal);
}

#[tokio::test]
async fn test_empty_token_routes_internal_only() {
    let h = Harness::new();
    let u1 = Uuid::new_v4();
    h.accept(u1, "c1", "2024-01-01T10:00").await;
    h.enable_push(u1, "").await;

    h.coordinator().run_pass(pass_time()).await.unwrap();

    assert_eq!(h.internal.calls(), 1);
    assert_eq!(h.push.calls(), 0);
}

#[tokio::test]
async fn test_malformed_records_do_not_affect_others() {
    let h = Harness::new();
    let broken_date = Uuid::new_v4();
    let broken_prefs = Uuid::new_v4();
    let healthy = Uuid::new_v4();
    h.accept(broken_date, "c1", "01/01/2024").await;
    h.accept(broken_prefs, "c1", "2024-01-01T10:00").await;
    h.storage
        .put(
            SETTINGS_COLLECTION,
            PUSH_SETTINGS_KEY,
            broken_prefs,
            json!({"isPushDisabled": "maybe"}),
        )
        .await;
    h.accept(healthy, "c1", "2024-01-01T10:00").await;

    let report = h.coordinator().run_pass(pass_time()).await.unwrap();

    assert_eq!(report.malformed, 2);
    assert_eq!(report.sent, 1);
    let entries = h.ledger.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].user_id, healthy);
}

#[tokio::test]
async fn test_timed_out_send_is_a_channel_failure() {
    let internal = ScriptedClient::with_delay(Channel::Internal, Duration::from_millis(200));
    let push = ScriptedClient::new(Channel::ExternalPush);
    let h = Harness::with_clients(internal, push);
    let u1 = Uuid::new_v4();
    h.accept(u1, "c1", "2024-01-01T10:00").await;

    let settings = DispatchSettings {
        send_timeout: Duration::from_millis(20),
        ..Default::default()
    };
    let report = h.coordinator_with(settings).run_pass(pass_time()).await.unwrap();

    assert_eq!(report.failed, 1);
    let entry = &h.ledger.entries().await[0];
    assert_eq!(entry.status, DeliveryStatus::Failed);
    assert!(!entry.received);
    assert!(entry.error_detail.as_deref().unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_send_timeout_is_shared_across_channels() {
    let internal = ScriptedClient::with_delay(Channel::Internal, Duration::from_millis(60));
    let push = ScriptedClient::with_delay(Channel::ExternalPush, Duration::from_millis(60));
    let h = Harness::with_clients(internal, push);
    let u1 = Uuid::new_v4();
    h.accept(u1, "c1", "2024-01-01T10:00").await;
    h.enable_push(u1, "tok").await;

    let settings = DispatchSettings {
        send_timeout: Duration::from_millis(100),
        ..Default::default()
    };
    let report = h.coordinator_with(settings).run_pass(pass_time()).await.unwrap();

    // The inbox send uses 60ms of the budget, so the push runs out at 100ms.
    assert_eq!(report.sent, 1);
    assert_eq!(h.internal.calls(), 1);
    assert_eq!(h.push.calls(), 1);
    let entry = &h.ledger.entries().await[0];
    assert_eq!(entry.status, DeliveryStatus::Sent);
    assert_eq!(entry.external_ref, None);
}

#[tokio::test]
async fn test_frequency_settings_gate_dispatch() {
    let h = Harness::new();
    let quiet = Uuid::new_v4();
    let reduced = Uuid::new_v4();
    h.set_frequency(quiet, "none").await;
    h.set_frequency(reduced, "reduced").await;
    h.accept(quiet, "c1", "2024-01-01T10:00").await;
    h.accept(reduced, "c1", "2024-01-01T10:00").await;
    h.accept(reduced, "c2", "2024-01-01T10:00").await;

    let coordinator = h.coordinator();
    let first = coordinator.run_pass(pass_time()).await.unwrap();
    assert_eq!(first.sent, 1);
    assert_eq!(first.suppressed, 2);

    // The reduced user's second reminder waits for the next day.
    let second = coordinator.run_pass(pass_time()).await.unwrap();
    assert_eq!(second.sent, 0);

    let next_day = Utc.with_ymd_and_hms(2024, 1, 2, 10, 6, 0).unwrap();
    let third = coordinator.run_pass(next_day).await.unwrap();
    assert_eq!(third.sent, 1);

    let entries = h.ledger.entries().await;
    assert!(entries.iter().all(|e| e.user_id == reduced));
    assert_eq!(entries.len(), 2);
}

#[tokio::test]
async fn test_orphaned_pending_entry_is_reclaimed_and_retried() {
    let h = Harness::new();
    let u1 = Uuid::new_v4();
    h.accept(u1, "c1", "2024-01-01T10:00").await;

    // A crashed process left a pending claim behind.
    h.ledger
        .record_attempt(&nudge_common::types::NewLedgerEntry {
            user_id: u1,
            challenge_slug: "c1".to_string(),
            channel: Channel::Internal,
            send_at: pass_time(),
        })
        .await
        .unwrap();

    let coordinator = h.coordinator();
    let blocked = coordinator.run_pass(Utc::now()).await.unwrap();
    assert_eq!(blocked.conflicts, 1);
    assert_eq!(h.internal.calls(), 0);

    let later = Utc::now() + chrono::Duration::hours(1);
    let report = coordinator.run_pass(later).await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.sent, 1);

    let entries = h.ledger.entries().await;
    assert_eq!(entries[0].status, DeliveryStatus::Failed);
    assert_eq!(entries[1].status, DeliveryStatus::Sent);
}

#[tokio::test]
async fn test_push_channel_without_client_falls_back_to_inbox() {
    let h = Harness::new();
    let u1 = Uuid::new_v4();
    h.accept(u1, "c1", "2024-01-01T10:00").await;
    h.enable_push(u1, "tok").await;

    let selector = CandidateSelector::new(h.storage.clone(), h.ledger.clone());
    let coordinator = DispatchCoordinator::new(selector, h.ledger.clone(), DispatchSettings::default())
        .with_client(h.internal.clone());

    let report = coordinator.run_pass(pass_time()).await.unwrap();

    assert_eq!(report.sent, 1);
    assert_eq!(h.push.calls(), 0);
    assert_eq!(h.ledger.entries().await[0].channel, Channel::Internal);
}

#[tokio::test]
async fn test_candidates_carry_joined_preference() {
    let h = Harness::new();
    let u1 = Uuid::new_v4();
    h.accept(u1, "c1", "2024-01-01T10:00").await;
    h.enable_push(u1, "tok").await;

    h.coordinator().run_pass(pass_time()).await.unwrap();

    let seen = h.push.seen.lock().await;
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].preference.push_token.as_deref(), Some("tok"));
    assert_eq!(
        seen[0].due_at,
        Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
    );
}
