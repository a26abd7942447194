//! OneSignal REST client.
//!
//! Covers the three calls the reminder flow needs:
//! - `POST /notifications` to schedule a push
//! - `DELETE /notifications/{id}?app_id=` to cancel a scheduled push
//! - `GET /notifications/{id}?app_id=` to check whether it is still scheduled
//!
//! Request bodies are built from typed structs and serialized with serde.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::{Deserialize, Serialize};

use nudge_common::config::PushConfig;
use nudge_common::error::AppError;

/// Hard ceiling on a single provider call.
const HTTP_TIMEOUT_SECS: u64 = 30;

/// A push to schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    /// Provider player ids / push tokens.
    pub recipients: Vec<String>,
    /// Locale key for `content`.
    pub language: String,
    pub content: String,
    /// Campaign name shown in the provider dashboard.
    pub campaign: String,
    /// Deliver at this time instead of immediately.
    pub send_after: Option<DateTime<Utc>>,
}

/// Provider acknowledgement of a scheduled push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushTicket {
    pub id: String,
    #[serde(default)]
    pub recipients: u64,
}

#[derive(Debug, Serialize)]
struct CreateNotificationBody<'a> {
    app_id: &'a str,
    include_player_ids: &'a [String],
    contents: BTreeMap<&'a str, &'a str>,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    send_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CreateNotificationResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    recipients: Option<u64>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CancelResponse {
    #[serde(default)]
    success: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct NotificationView {
    id: String,
    #[serde(default)]
    canceled: bool,
}

/// HTTP client bound to one OneSignal app.
#[derive(Debug, Clone)]
pub struct OneSignalClient {
    http: reqwest::Client,
    app_id: String,
    rest_api_key: String,
    base_url: Url,
}

impl OneSignalClient {
    pub fn new(config: &PushConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let base_url = Url::parse(config.api_url.trim_end_matches('/')).map_err(|e| {
            AppError::Config(format!("Invalid OneSignal API URL '{}': {}", config.api_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "OneSignal API URL '{}' cannot carry a path",
                config.api_url
            )));
        }

        Ok(Self {
            http,
            app_id: config.app_id.clone(),
            rest_api_key: config.rest_api_key.clone(),
            base_url,
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Schedule a push and return the provider's delivery id.
    pub async fn schedule(&self, message: &PushMessage) -> Result<PushTicket, AppError> {
        if message.recipients.iter().all(|r| r.trim().is_empty()) {
            return Err(AppError::Validation(
                "push message has no recipient".to_string(),
            ));
        }

        let body = CreateNotificationBody {
            app_id: &self.app_id,
            include_player_ids: &message.recipients,
            contents: BTreeMap::from([(message.language.as_str(), message.content.as_str())]),
            name: &message.campaign,
            send_after: message.send_after,
        };

        let response = self
            .http
            .post(self.endpoint(&["notifications"])?)
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, self.auth_header())
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::DeliveryFailed(format!("OneSignal unreachable: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AppError::DeliveryFailed(format!("OneSignal response unreadable: {}", e)))?;

        if !status.is_success() {
            return Err(AppError::DeliveryFailed(format!(
                "OneSignal rejected push ({}): {}",
                status,
                truncate(&text)
            )));
        }

        let parsed: CreateNotificationResponse = serde_json::from_str(&text).map_err(|e| {
            AppError::DeliveryFailed(format!("OneSignal response malformed: {}", e))
        })?;

        match parsed.id.filter(|id| !id.is_empty()) {
            Some(id) => {
                tracing::debug!(
                    notification_id = %id,
                    recipients = parsed.recipients.unwrap_or_default(),
                    "OneSignal push scheduled"
                );
                Ok(PushTicket {
                    id,
                    recipients: parsed.recipients.unwrap_or_default(),
                })
            }
            None => Err(AppError::DeliveryFailed(format!(
                "OneSignal returned no notification id: {}",
                parsed
                    .errors
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| truncate(&text))
            ))),
        }
    }

    /// Cancel a push that has not been delivered yet.
    pub async fn cancel(&self, notification_id: &str) -> Result<(), AppError> {
        if notification_id.trim().is_empty() {
            return Err(AppError::Validation("notification id is empty".to_string()));
        }

        let response = self
            .http
            .delete(self.notification_url(notification_id)?)
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, self.auth_header())
            .send()
            .await
            .map_err(|e| AppError::DeliveryFailed(format!("OneSignal unreachable: {}", e)))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if status == StatusCode::NOT_FOUND {
            return Err(AppError::NotFound(format!(
                "push {} is not scheduled",
                notification_id
            )));
        }
        if !status.is_success() {
            return Err(AppError::DeliveryFailed(format!(
                "OneSignal refused cancel ({}): {}",
                status,
                truncate(&text)
            )));
        }

        // An empty 2xx body counts as success; an explicit `success: false` does not.
        if !text.trim().is_empty() {
            let parsed: CancelResponse = serde_json::from_str(&text).map_err(|e| {
                AppError::DeliveryFailed(format!("OneSignal response malformed: {}", e))
            })?;
            if parsed.success == Some(false) {
                return Err(AppError::DeliveryFailed(format!(
                    "OneSignal could not cancel {}",
                    notification_id
                )));
            }
        }

        tracing::info!(notification_id = %notification_id, "OneSignal push cancelled");
        Ok(())
    }

    /// Look up a push. `None` when the provider does not know it or it was cancelled.
    pub async fn lookup(&self, notification_id: &str) -> Result<Option<PushTicket>, AppError> {
        let response = self
            .http
            .get(self.notification_url(notification_id)?)
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, self.auth_header())
            .send()
            .await
            .map_err(|e| AppError::DeliveryFailed(format!("OneSignal unreachable: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AppError::DeliveryFailed(format!(
                "OneSignal lookup failed ({}): {}",
                status,
                truncate(&text)
            )));
        }

        let view: NotificationView = serde_json::from_str(&text).map_err(|e| {
            AppError::DeliveryFailed(format!("OneSignal response malformed: {}", e))
        })?;

        if view.canceled {
            return Ok(None);
        }
        Ok(Some(PushTicket {
            id: view.id,
            recipients: 0,
        }))
    }

    /// `{base}/notifications/{id}?app_id={app}`, with the id kept as one path segment.
    fn notification_url(&self, notification_id: &str) -> Result<Url, AppError> {
        let mut url = self.endpoint(&["notifications", notification_id])?;
        url.query_pairs_mut().append_pair("app_id", &self.app_id);
        Ok(url)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, AppError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config(format!("OneSignal API URL {} has no path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn auth_header(&self) -> String {
        format!("Basic {}", self.rest_api_key)
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 256;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
