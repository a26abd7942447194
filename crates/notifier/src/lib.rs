//! Delivery clients for checkpoint reminders.
//!
//! Two implementations of [`DeliveryClient`]:
//! - [`inbox::InboxNotifier`] writes to the host's in-app notification inbox
//! - [`push::ExternalPushSender`] schedules a push through OneSignal

pub mod inbox;
pub mod onesignal;
pub mod push;

use async_trait::async_trait;

use nudge_common::error::AppError;
use nudge_common::types::{Candidate, Channel};

/// Capability shared by every reminder channel.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    /// The channel this client delivers through.
    fn channel(&self) -> Channel;

    /// Deliver a reminder for the candidate.
    ///
    /// Returns the provider's delivery identifier when the channel has one.
    async fn send(&self, candidate: &Candidate) -> Result<Option<String>, AppError>;

    /// Withdraw a delivery that was scheduled but has not gone out yet.
    async fn cancel(&self, external_ref: &str) -> Result<(), AppError> {
        Err(AppError::Validation(format!(
            "{} channel cannot cancel delivery {}",
            self.channel(),
            external_ref
        )))
    }
}

pub use inbox::InboxNotifier;
pub use onesignal::{OneSignalClient, PushMessage, PushTicket};
pub use push::{ExternalPushSender, MessageTemplate};

#[cfg(test)]
mod tests {
    use super::*;

    struct InboxOnly;

    #[async_trait]
    impl DeliveryClient for InboxOnly {
        fn channel(&self) -> Channel {
            Channel::Internal
        }

        async fn send(&self, _candidate: &Candidate) -> Result<Option<String>, AppError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_channels_without_withdrawal_reject_cancel() {
        let err = InboxOnly.cancel("n-1").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(ref d) if d.contains("internal")));
    }
}
