use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Seconds between reconciliation passes (default: 5)
    pub dispatch_interval_secs: u64,

    /// Upper bound on a single channel send in milliseconds (default: 10000)
    pub dispatch_send_timeout_ms: u64,

    /// Candidates processed concurrently within one pass (default: 8)
    pub dispatch_max_concurrency: usize,

    /// Age in seconds after which an orphaned pending ledger entry is reclaimed (default: 300)
    pub dispatch_stale_pending_secs: u64,

    /// OneSignal application id. Push delivery is disabled when unset.
    pub one_signal_app_id: Option<String>,

    /// OneSignal REST API key
    pub one_signal_rest_api_key: Option<String>,

    /// OneSignal API base URL
    pub one_signal_api_url: String,

    /// Campaign name attached to every scheduled push
    pub push_campaign_name: String,

    /// Push content template, `{challenge}` and `{user}` are substituted
    pub push_message_template: String,

    /// Locale key used for push content
    pub push_language: String,

    /// Code attached to internal inbox notifications
    pub inbox_notification_code: i32,

    /// Listen address for the RPC server
    pub api_bind_addr: String,
}

/// Credentials and endpoint for the push provider, present only when fully configured.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub app_id: String,
    pub rest_api_key: String,
    pub api_url: String,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            dispatch_interval_secs: parse_var("DISPATCH_INTERVAL_SECS", 5)?,
            dispatch_send_timeout_ms: parse_var("DISPATCH_SEND_TIMEOUT_MS", 10_000)?,
            dispatch_max_concurrency: parse_var("DISPATCH_MAX_CONCURRENCY", 8)?,
            dispatch_stale_pending_secs: parse_var("DISPATCH_STALE_PENDING_SECS", 300)?,
            one_signal_app_id: non_empty_var("ONE_SIGNAL_APP_ID"),
            one_signal_rest_api_key: non_empty_var("ONE_SIGNAL_REST_API_KEY"),
            one_signal_api_url: std::env::var("ONE_SIGNAL_API_URL")
                .unwrap_or_else(|_| "https://onesignal.com/api/v1".to_string()),
            push_campaign_name: std::env::var("PUSH_CAMPAIGN_NAME")
                .unwrap_or_else(|_| "REMINDER".to_string()),
            push_message_template: std::env::var("PUSH_MESSAGE_TEMPLATE")
                .unwrap_or_else(|_| "{challenge}".to_string()),
            push_language: std::env::var("PUSH_LANGUAGE").unwrap_or_else(|_| "en".to_string()),
            inbox_notification_code: parse_var("INBOX_NOTIFICATION_CODE", 5000)?,
            api_bind_addr: std::env::var("API_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
        })
    }

    /// Push provider settings, or `None` when the app id or API key is missing.
    pub fn push(&self) -> Option<PushConfig> {
        match (&self.one_signal_app_id, &self.one_signal_rest_api_key) {
            (Some(app_id), Some(key)) => Some(PushConfig {
                app_id: app_id.clone(),
                rest_api_key: key.clone(),
                api_url: self.one_signal_api_url.trim_end_matches('/').to_string(),
            }),
            _ => None,
        }
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_send_timeout_ms)
    }

    pub fn stale_pending_after(&self) -> Duration {
        Duration::from_secs(self.dispatch_stale_pending_secs)
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => parse_value(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> anyhow::Result<T> {
    raw.trim().parse().map_err(|_| {
        anyhow::anyhow!(
            "{} must be a valid {}",
            name,
            std::any::type_name::<T>()
        )
    })
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
