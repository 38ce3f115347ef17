//! Error taxonomy for the sync layer.

use relaysync_protocol::FilterError;
use relaysync_transport::RelayUrl;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Event store and persistence errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Stored data could not be (de)serialised.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend-specific failure.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Errors surfaced by the sync layer.
///
/// Cloneable so one failure can be delivered to every listener attached to a
/// shared subscription.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Relay unreachable or disconnected. Not retried automatically.
    #[error("Transport error on {relay}: {message}")]
    Transport {
        /// Relay that failed.
        relay: RelayUrl,
        /// What went wrong.
        message: String,
    },

    /// Authentication handshake did not complete in time.
    #[error("Authentication with {0} timed out")]
    AuthTimeout(RelayUrl),

    /// Relay explicitly invalidated the session or refused the handshake.
    #[error("Relay {0} rejected authentication")]
    AuthRejected(RelayUrl),

    /// Event store failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// No activity on a subscription before its timeout.
    #[error("Subscription '{name}' saw no activity within {timeout:?}")]
    Timeout {
        /// Subscription name.
        name: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// Concurrent subscription cap reached and nothing could be shed.
    #[error("Maximum concurrent subscriptions reached ({0})")]
    SubscriptionLimit(usize),

    /// Subscription cancelled to make room for higher-priority work.
    #[error("Subscription '{0}' was shed under load")]
    Shed(String),

    /// Filter set rejected before reaching any relay.
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// No feed with that name.
    #[error("Feed not found: {0}")]
    FeedNotFound(String),

    /// Feed name already in use with different filters.
    #[error("Feed '{0}' is already subscribed with different filters")]
    FeedConflict(String),

    /// Internal channel closed while waiting.
    #[error("Channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Build a transport error for a relay.
    #[must_use]
    pub fn transport(relay: &RelayUrl, message: impl fmt::Display) -> Self {
        SyncError::Transport {
            relay: relay.clone(),
            message: message.to_string(),
        }
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Transport { .. } => "transport",
            SyncError::AuthTimeout(_) => "auth_timeout",
            SyncError::AuthRejected(_) => "auth_rejected",
            SyncError::Storage(_) => "storage",
            SyncError::Timeout { .. } => "timeout",
            SyncError::SubscriptionLimit(_) => "subscription_limit",
            SyncError::Shed(_) => "shed",
            SyncError::InvalidFilter(_) => "invalid_filter",
            SyncError::FeedNotFound(_) => "feed_not_found",
            SyncError::FeedConflict(_) => "feed_conflict",
            SyncError::ChannelClosed => "channel_closed",
        }
    }
}

impl From<FilterError> for SyncError {
    fn from(e: FilterError) -> Self {
        SyncError::InvalidFilter(e.to_string())
    }
}
