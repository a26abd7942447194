use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Layout of `nextCheckpoint` values written by the challenge flow, read as UTC.
pub const CHECKPOINT_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// How often a user agreed to be reminded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[default]
    All,
    Reduced,
    None,
}

/// Delivery mechanism for a reminder.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Internal,
    ExternalPush,
}

/// Ledger entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// A user's accepted challenge with a computed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub user_id: Uuid,
    pub challenge_slug: String,
    pub next_checkpoint: DateTime<Utc>,
}

/// Per-user notification settings after defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPreference {
    pub user_id: Uuid,
    pub frequency: Frequency,
    pub push_enabled: bool,
    pub push_token: Option<String>,
    pub push_subscribed: bool,
}

/// `notification-settings/notification-freq` storage document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrequencyDocument {
    /// `null` and a missing field both mean `all`.
    #[serde(default)]
    pub frequency: Option<Frequency>,
}

/// `notification-settings/onesignal-settings` storage document.
///
/// Missing flags fall back to the conservative side: push disabled, not subscribed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushSettingsDocument {
    #[serde(default = "default_push_disabled")]
    pub is_push_disabled: bool,
    #[serde(default)]
    pub is_subscribed: bool,
    #[serde(default)]
    pub push_token: Option<String>,
    /// Provider-side player id, informational only.
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_push_disabled() -> bool {
    true
}

impl NotificationPreference {
    /// Preference applied when the user never stored any settings.
    pub fn default_for(user_id: Uuid) -> Self {
        Self {
            user_id,
            frequency: Frequency::All,
            push_enabled: false,
            push_token: None,
            push_subscribed: false,
        }
    }

    /// Build a preference from the two raw storage documents, either of which may be absent.
    ///
    /// A document that is present but does not match its expected shape is rejected
    /// with `MalformedInput` instead of being zero-filled.
    pub fn from_documents(
        user_id: Uuid,
        frequency: Option<&serde_json::Value>,
        push: Option<&serde_json::Value>,
    ) -> Result<Self, AppError> {
        let mut pref = Self::default_for(user_id);

        if let Some(doc) = frequency {
            let doc = FrequencyDocument::deserialize(doc).map_err(|e| {
                AppError::MalformedInput(format!(
                    "notification-freq document for {}: {}",
                    user_id, e
                ))
            })?;
            pref.frequency = doc.frequency.unwrap_or_default();
        }

        if let Some(doc) = push {
            let doc = PushSettingsDocument::deserialize(doc).map_err(|e| {
                AppError::MalformedInput(format!(
                    "onesignal-settings document for {}: {}",
                    user_id, e
                ))
            })?;
            pref.push_enabled = !doc.is_push_disabled;
            pref.push_subscribed = doc.is_subscribed;
            pref.push_token = doc.push_token;
        }

        Ok(pref)
    }
}

/// Parse a stored checkpoint. Accepts the minute-precision layout and RFC 3339.
pub fn parse_checkpoint(raw: &str) -> Result<DateTime<Utc>, AppError> {
    let raw = raw.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, CHECKPOINT_FORMAT) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::MalformedInput(format!("checkpoint '{}': {}", raw, e)))
}

/// One row of the `reminder_ledger` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryLedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub challenge_slug: String,
    pub channel: Channel,
    pub external_ref: Option<String>,
    pub send_at: DateTime<Utc>,
    pub received: bool,
    pub status: DeliveryStatus,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values for a ledger insert; the store assigns the id and starts it as pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub user_id: Uuid,
    pub challenge_slug: String,
    pub channel: Channel,
    pub send_at: DateTime<Utc>,
}

/// Final state written back after the channel sends complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub status: DeliveryStatus,
    pub external_ref: Option<String>,
    pub error_detail: Option<String>,
}

impl DeliveryOutcome {
    pub fn sent(external_ref: Option<String>) -> Self {
        Self {
            status: DeliveryStatus::Sent,
            external_ref,
            error_detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            external_ref: None,
            error_detail: Some(detail.into()),
        }
    }
}

/// A user/challenge pair due for a reminder in the current pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub user_id: Uuid,
    pub challenge_slug: String,
    pub due_at: DateTime<Utc>,
    pub preference: NotificationPreference,
    pub prior_entry: Option<DeliveryLedgerEntry>,
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frequency::All => write!(f, "all"),
            Frequency::Reduced => write!(f, "reduced"),
            Frequency::None => write!(f, "none"),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Internal => write!(f, "internal"),
            Channel::ExternalPush => write!(f, "external_push"),
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
        }
    }
}
