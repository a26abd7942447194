//! External push channel backed by [`OneSignalClient`].

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use nudge_common::config::AppConfig;
use nudge_common::error::AppError;
use nudge_common::types::{Candidate, Channel};

use crate::DeliveryClient;
use crate::onesignal::{OneSignalClient, PushMessage};

/// Push content template. `{challenge}` and `{user}` are replaced at render time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate(String);

impl MessageTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn render(&self, user_id: Uuid, challenge_slug: &str) -> String {
        self.0
            .replace("{challenge}", challenge_slug)
            .replace("{user}", &user_id.to_string())
    }
}

impl Default for MessageTemplate {
    fn default() -> Self {
        Self::new("{challenge}")
    }
}

/// Sends reminders as OneSignal pushes addressed to the user's push token.
pub struct ExternalPushSender {
    client: Arc<OneSignalClient>,
    template: MessageTemplate,
    campaign: String,
    language: String,
}

impl ExternalPushSender {
    pub fn new(client: Arc<OneSignalClient>, config: &AppConfig) -> Self {
        Self {
            client,
            template: MessageTemplate::new(config.push_message_template.clone()),
            campaign: config.push_campaign_name.clone(),
            language: config.push_language.clone(),
        }
    }

    fn build_message(&self, candidate: &Candidate) -> Result<PushMessage, AppError> {
        let token = candidate
            .preference
            .push_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AppError::DeliveryFailed(format!(
                    "user {} has no push token",
                    candidate.user_id
                ))
            })?;

        Ok(PushMessage {
            recipients: vec![token.to_string()],
            language: self.language.clone(),
            content: self
                .template
                .render(candidate.user_id, &candidate.challenge_slug),
            campaign: self.campaign.clone(),
            send_after: None,
        })
    }
}

#[async_trait]
impl DeliveryClient for ExternalPushSender {
    fn channel(&self) -> Channel {
        Channel::ExternalPush
    }

    async fn send(&self, candidate: &Candidate) -> Result<Option<String>, AppError> {
        let message = self.build_message(candidate)?;
        let ticket = self.client.schedule(&message).await?;

        tracing::info!(
            user_id = %candidate.user_id,
            challenge = %candidate.challenge_slug,
            notification_id = %ticket.id,
            "Push reminder scheduled"
        );
        Ok(Some(ticket.id))
    }

    async fn cancel(&self, external_ref: &str) -> Result<(), AppError> {
        self.client.cancel(external_ref).await
    }
}
