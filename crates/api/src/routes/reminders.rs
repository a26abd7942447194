//! Reminder RPCs backed by the push provider.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use nudge_common::error::AppError;
use nudge_notifier::{PushMessage, PushTicket};

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rpc/schedule_reminder", post(schedule_reminder))
        .route("/rpc/cancel_reminder", post(cancel_reminder))
}

#[derive(Debug, Deserialize)]
pub struct ScheduleReminderRequest {
    /// Provider player id / push token.
    pub recipient: String,
    pub message: String,
    #[serde(default)]
    pub send_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub challenge_slug: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelReminderRequest {
    pub id: String,
}

/// POST /rpc/schedule_reminder — Schedule a push for one recipient.
async fn schedule_reminder(
    State(state): State<AppState>,
    Json(request): Json<ScheduleReminderRequest>,
) -> Result<Json<PushTicket>, AppError> {
    if request.recipient.trim().is_empty() {
        return Err(AppError::Validation("recipient is required".to_string()));
    }
    if request.message.trim().is_empty() {
        return Err(AppError::Validation("message is required".to_string()));
    }

    let client = state.push_client()?;
    let message = PushMessage {
        recipients: vec![request.recipient.trim().to_string()],
        language: state.config.push_language.clone(),
        content: request.message,
        campaign: state.config.push_campaign_name.clone(),
        send_after: request.send_after,
    };

    let ticket = client.schedule(&message).await?;
    tracing::info!(
        notification_id = %ticket.id,
        challenge = request.challenge_slug.as_deref().unwrap_or("-"),
        send_after = ?request.send_after,
        "Reminder scheduled"
    );
    Ok(Json(ticket))
}

/// POST /rpc/cancel_reminder — Cancel a push that has not gone out yet.
async fn cancel_reminder(
    State(state): State<AppState>,
    Json(request): Json<CancelReminderRequest>,
) -> Result<Json<Value>, AppError> {
    if request.id.trim().is_empty() {
        return Err(AppError::Validation("id is required".to_string()));
    }

    state.push_channel()?.cancel(request.id.trim()).await?;
    tracing::info!(notification_id = %request.id, "Reminder cancelled");
    Ok(Json(json!({"cancelled": true})))
}
