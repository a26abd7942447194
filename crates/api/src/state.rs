//! Shared application state for the Axum API server.

use std::sync::Arc;

use nudge_common::config::AppConfig;
use nudge_common::error::AppError;
use nudge_notifier::{DeliveryClient, ExternalPushSender, OneSignalClient};

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    /// `None` when OneSignal credentials are not configured.
    pub push: Option<Arc<OneSignalClient>>,
    /// Push delivery channel over the same client; withdraws scheduled reminders.
    pub push_channel: Option<Arc<dyn DeliveryClient>>,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(config: AppConfig) -> Result<Self, AppError> {
        let push = match config.push() {
            Some(push) => Some(Arc::new(OneSignalClient::new(&push)?)),
            None => None,
        };
        let push_channel = push.clone().map(|client| {
            Arc::new(ExternalPushSender::new(client, &config)) as Arc<dyn DeliveryClient>
        });
        Ok(Self {
            push,
            push_channel,
            config,
        })
    }

    /// The provider client, or a configuration error when push is disabled.
    pub fn push_client(&self) -> Result<&OneSignalClient, AppError> {
        self.push
            .as_deref()
            .ok_or_else(|| AppError::Config("push provider is not configured".to_string()))
    }

    /// The push delivery channel, or a configuration error when push is disabled.
    pub fn push_channel(&self) -> Result<&dyn DeliveryClient, AppError> {
        self.push_channel
            .as_deref()
            .ok_or_else(|| AppError::Config("push provider is not configured".to_string()))
    }
}
