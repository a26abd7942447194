//! Channel routing from notification preferences.

use std::collections::BTreeSet;

use nudge_common::types::{Channel, NotificationPreference};

/// Channels a reminder goes out on.
///
/// The inbox is always used. Push is added only when the user enabled it,
/// is subscribed, and has a non-blank token.
pub fn route_channels(preference: &NotificationPreference) -> BTreeSet<Channel> {
    let mut channels = BTreeSet::from([Channel::Internal]);

    let has_token = preference
        .push_token
        .as_deref()
        .is_some_and(|t| !t.trim().is_empty());

    if preference.push_enabled && preference.push_subscribed && has_token {
        channels.insert(Channel::ExternalPush);
    }
    channels
}
