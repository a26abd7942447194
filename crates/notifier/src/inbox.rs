//! Internal channel: the host's in-app notification inbox.
//!
//! The inbox has no delivery confirmation. A row landing in `notification`
//! is all the success signal there is, so this client never returns an
//! external reference.

use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use nudge_common::error::AppError;
use nudge_common::types::{Candidate, Channel};

use crate::DeliveryClient;

/// Sender id used for notifications that originate from the system.
pub const SYSTEM_SENDER_ID: Uuid = Uuid::nil();

pub struct InboxNotifier {
    pool: PgPool,
    code: i32,
}

impl InboxNotifier {
    pub fn new(pool: PgPool, code: i32) -> Self {
        Self { pool, code }
    }
}

#[async_trait]
impl DeliveryClient for InboxNotifier {
    fn channel(&self) -> Channel {
        Channel::Internal
    }

    async fn send(&self, candidate: &Candidate) -> Result<Option<String>, AppError> {
        let content = json!({
            "challenge_slug": candidate.challenge_slug,
            "due_at": candidate.due_at,
        });

        sqlx::query(
            r#"
            INSERT INTO notification (id, user_id, subject, content, code, sender_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(candidate.user_id)
        .bind(&candidate.challenge_slug)
        .bind(&content)
        .bind(self.code)
        .bind(SYSTEM_SENDER_ID)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            user_id = %candidate.user_id,
            challenge = %candidate.challenge_slug,
            "Inbox reminder sent"
        );
        Ok(None)
    }
}
