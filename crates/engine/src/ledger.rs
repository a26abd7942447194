//! Delivery ledger, the only authority on whether a reminder went out.
//!
//! Every dispatch starts with [`LedgerStore::record_attempt`], which inserts a
//! `pending` row. The insert is guarded by a partial unique index on
//! `(user_id, challenge_slug) WHERE status <> 'failed'`, so for any pair there
//! is at most one open or delivered entry across all processes. A second
//! attempt gets `AppError::Conflict` and must not send.
//!
//! Entry lifecycle:
//! - `pending` → `sent` (received = true, terminal)
//! - `pending` → `failed` (received = false, pair becomes claimable again)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use nudge_common::db::is_unique_violation;
use nudge_common::error::AppError;
use nudge_common::types::{DeliveryLedgerEntry, DeliveryOutcome, DeliveryStatus, NewLedgerEntry};

/// Detail stored on pending entries that outlived their owner.
const ABANDONED_DETAIL: &str = "attempt abandoned before an outcome was recorded";

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Most relevant entry for the pair that has not been received: the open
    /// `pending` one if any, otherwise the latest `failed` one.
    async fn find_pending(
        &self,
        user_id: Uuid,
        challenge_slug: &str,
    ) -> Result<Option<DeliveryLedgerEntry>, AppError>;

    /// Claim the pair by inserting a `pending` entry. `Conflict` when the pair
    /// already has an open or delivered entry.
    async fn record_attempt(&self, entry: &NewLedgerEntry) -> Result<Uuid, AppError>;

    /// Close a `pending` entry. A `sent` outcome also sets `received`.
    async fn mark_outcome(&self, id: Uuid, outcome: &DeliveryOutcome) -> Result<(), AppError>;

    /// One entry per pair, preferring a received entry over the latest attempt.
    async fn latest_entries(&self) -> Result<Vec<DeliveryLedgerEntry>, AppError>;

    /// Fail `pending` entries created before `cutoff`. Returns how many were reclaimed.
    async fn reclaim_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError>;
}

/// Apply the schema migrations. Any failure here is fatal for startup.
pub async fn migrate(pool: &PgPool) -> Result<(), AppError> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| AppError::Fatal(format!("Failed to prepare reminder ledger: {}", e)))?;
    tracing::info!("Reminder ledger schema ready");
    Ok(())
}

fn check_outcome(outcome: &DeliveryOutcome) -> Result<(), AppError> {
    if outcome.status == DeliveryStatus::Pending {
        return Err(AppError::Validation(
            "an outcome must be sent or failed".to_string(),
        ));
    }
    Ok(())
}

/// Postgres-backed ledger over `reminder_ledger`.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn find_pending(
        &self,
        user_id: Uuid,
        challenge_slug: &str,
    ) -> Result<Option<DeliveryLedgerEntry>, AppError> {
        let entry: Option<DeliveryLedgerEntry> = sqlx::query_as(
            r#"
            SELECT * FROM reminder_ledger
            WHERE user_id = $1 AND challenge_slug = $2 AND NOT received
            ORDER BY (status = 'pending') DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(challenge_slug)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entry)
    }

    async fn record_attempt(&self, entry: &NewLedgerEntry) -> Result<Uuid, AppError> {
        let result: Result<Option<(Uuid,)>, sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO reminder_ledger (id, user_id, challenge_slug, channel, send_at, received, status)
            VALUES ($1, $2, $3, $4, $5, false, 'pending')
            ON CONFLICT (user_id, challenge_slug) WHERE status <> 'failed' DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.user_id)
        .bind(&entry.challenge_slug)
        .bind(entry.channel.to_string())
        .bind(entry.send_at)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some((id,))) => Ok(id),
            Ok(None) => Err(AppError::Conflict(format!(
                "{}/{} is already claimed",
                entry.user_id, entry.challenge_slug
            ))),
            Err(e) if is_unique_violation(&e) => Err(AppError::Conflict(format!(
                "{}/{} is already claimed",
                entry.user_id, entry.challenge_slug
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn mark_outcome(&self, id: Uuid, outcome: &DeliveryOutcome) -> Result<(), AppError> {
        check_outcome(outcome)?;

        let result = sqlx::query(
            r#"
            UPDATE reminder_ledger
            SET status = $2,
                received = received OR $3,
                external_ref = COALESCE($4, external_ref),
                error_detail = $5,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(outcome.status.to_string())
        .bind(outcome.status == DeliveryStatus::Sent)
        .bind(&outcome.external_ref)
        .bind(&outcome.error_detail)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM reminder_ledger WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match current {
            None => Err(AppError::NotFound(format!("ledger entry {} not found", id))),
            Some((status,)) => Err(AppError::Conflict(format!(
                "ledger entry {} is already {}",
                id, status
            ))),
        }
    }

    async fn latest_entries(&self) -> Result<Vec<DeliveryLedgerEntry>, AppError> {
        let entries: Vec<DeliveryLedgerEntry> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (user_id, challenge_slug) *
            FROM reminder_ledger
            ORDER BY user_id, challenge_slug, received DESC, created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn reclaim_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE reminder_ledger
            SET status = 'failed', error_detail = $2, updated_at = NOW()
            WHERE status = 'pending' AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(ABANDONED_DETAIL)
        .execute(&self.pool)
        .await?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            tracing::warn!(reclaimed, cutoff = %cutoff, "Reclaimed stale pending ledger entries");
        }
        Ok(reclaimed)
    }
}

/// In-process ledger with the same gate semantics as [`PgLedgerStore`].
#[derive(Default)]
pub struct MemoryLedgerStore {
    entries: Mutex<Vec<DeliveryLedgerEntry>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry in insertion order.
    pub async fn entries(&self) -> Vec<DeliveryLedgerEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn find_pending(
        &self,
        user_id: Uuid,
        challenge_slug: &str,
    ) -> Result<Option<DeliveryLedgerEntry>, AppError> {
        let entries = self.entries.lock().await;
        let mut open: Vec<&DeliveryLedgerEntry> = entries
            .iter()
            .filter(|e| e.user_id == user_id && e.challenge_slug == challenge_slug && !e.received)
            .collect();
        open.sort_by_key(|e| (e.status == DeliveryStatus::Pending, e.created_at));
        Ok(open.last().map(|e| (*e).clone()))
    }

    async fn record_attempt(&self, entry: &NewLedgerEntry) -> Result<Uuid, AppError> {
        let mut entries = self.entries.lock().await;
        let claimed = entries.iter().any(|e| {
            e.user_id == entry.user_id
                && e.challenge_slug == entry.challenge_slug
                && e.status != DeliveryStatus::Failed
        });
        if claimed {
            return Err(AppError::Conflict(format!(
                "{}/{} is already claimed",
                entry.user_id, entry.challenge_slug
            )));
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        entries.push(DeliveryLedgerEntry {
            id,
            user_id: entry.user_id,
            challenge_slug: entry.challenge_slug.clone(),
            channel: entry.channel,
            external_ref: None,
            send_at: entry.send_at,
            received: false,
            status: DeliveryStatus::Pending,
            error_detail: None,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn mark_outcome(&self, id: Uuid, outcome: &DeliveryOutcome) -> Result<(), AppError> {
        check_outcome(outcome)?;

        let mut entries = self.entries.lock().await;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| AppError::NotFound(format!("ledger entry {} not found", id)))?;

        if entry.status != DeliveryStatus::Pending {
            return Err(AppError::Conflict(format!(
                "ledger entry {} is already {}",
                id, entry.status
            )));
        }

        entry.status = outcome.status;
        entry.received = entry.received || outcome.status == DeliveryStatus::Sent;
        if outcome.external_ref.is_some() {
            entry.external_ref = outcome.external_ref.clone();
        }
        entry.error_detail = outcome.error_detail.clone();
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn latest_entries(&self) -> Result<Vec<DeliveryLedgerEntry>, AppError> {
        let entries = self.entries.lock().await;
        let mut latest: Vec<DeliveryLedgerEntry> = Vec::new();
        for entry in entries.iter() {
            match latest
                .iter_mut()
                .find(|e| e.user_id == entry.user_id && e.challenge_slug == entry.challenge_slug)
            {
                Some(current) => {
                    if (entry.received, entry.created_at) >= (current.received, current.created_at)
                    {
                        *current = entry.clone();
                    }
                }
                None => latest.push(entry.clone()),
            }
        }
        Ok(latest)
    }

    async fn reclaim_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        let mut entries = self.entries.lock().await;
        let mut reclaimed = 0;
        for entry in entries
            .iter_mut()
            .filter(|e| e.status == DeliveryStatus::Pending && e.created_at < cutoff)
        {
            entry.status = DeliveryStatus::Failed;
            entry.error_detail = Some(ABANDONED_DETAIL.to_string());
            entry.updated_at = Utc::now();
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}
