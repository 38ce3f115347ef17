//! Relay transport abstraction.
//!
//! A transport owns the connection to one relay. Callers hand it a filter set
//! and get back a stream of notifications; the end of stored events arrives
//! in-band on that stream instead of through a callback.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use relaysync_protocol::{ClosedReason, Event, Filter, ProtocolError, RelayMessage};
use std::fmt;
use thiserror::Error;

/// Normalised relay URL.
///
/// Scheme and host are lowercased and trailing slashes removed so that
/// `WSS://Relay.example/` and `wss://relay.example` name the same relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayUrl(String);

impl RelayUrl {
    /// Create a normalised relay URL.
    #[must_use]
    pub fn new(url: impl AsRef<str>) -> Self {
        let trimmed = url.as_ref().trim().trim_end_matches('/');
        let normalized = match trimmed.split_once("://") {
            Some((scheme, rest)) => {
                let (host, path) = match rest.find('/') {
                    Some(idx) => rest.split_at(idx),
                    None => (rest, ""),
                };
                format!("{}://{}{}", scheme.to_lowercase(), host.to_lowercase(), path)
            }
            None => trimmed.to_lowercase(),
        };
        Self(normalized)
    }

    /// Get the URL as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelayUrl {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RelayUrl {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Identifier of a subscription on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    /// Create a new subscription ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Something a relay told us about one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayNotification {
    /// A matching event, stored or live.
    Event(Event),
    /// The relay finished replaying stored events; later events are live.
    EndOfStoredEvents,
    /// The relay ended the subscription.
    Closed(ClosedReason),
    /// The relay issued an authentication challenge.
    AuthChallenge(String),
    /// Human-readable notice.
    Notice(String),
}

impl RelayNotification {
    /// Map a relay frame to a notification. `OK` frames carry no
    /// subscription data and map to `None`.
    #[must_use]
    pub fn from_frame(frame: RelayMessage) -> Option<Self> {
        match frame {
            RelayMessage::Event { event, .. } => Some(RelayNotification::Event(event)),
            RelayMessage::EndOfStoredEvents { .. } => Some(RelayNotification::EndOfStoredEvents),
            RelayMessage::Closed { message, .. } => {
                Some(RelayNotification::Closed(ClosedReason::parse(message)))
            }
            RelayMessage::Auth { challenge } => Some(RelayNotification::AuthChallenge(challenge)),
            RelayMessage::Notice(message) => Some(RelayNotification::Notice(message)),
            RelayMessage::Ok { .. } => None,
        }
    }
}

/// Stream of notifications for one subscription on one relay.
///
/// The stream ends when the subscription is closed or the connection drops.
pub type RelayStream = BoxStream<'static, RelayNotification>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Relay could not be reached.
    #[error("Relay unreachable: {0}")]
    Unreachable(String),

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Connection to a single relay.
///
/// Implementations handle the socket, reconnection and framing; callers only
/// see filter sets going in and notifications coming out.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// URL of the relay this transport talks to.
    fn url(&self) -> &RelayUrl;

    /// Open a subscription over the given filters.
    ///
    /// The returned stream yields stored events, then
    /// [`RelayNotification::EndOfStoredEvents`], then live events until the
    /// subscription is closed.
    async fn subscribe(
        &self,
        id: &SubscriptionId,
        filters: Vec<Filter>,
    ) -> Result<RelayStream, TransportError>;

    /// Close a subscription. Closing an unknown subscription is not an error.
    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), TransportError>;

    /// Check if the transport is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaysync_protocol::ClosedPrefix;

    #[test]
    fn test_relay_url_normalization() {
        assert_eq!(
            RelayUrl::new("WSS://Relay.Example.com/"),
            RelayUrl::new("wss://relay.example.com")
        );
        assert_eq!(
            RelayUrl::new("wss://relay.example.com/Path/").as_str(),
            "wss://relay.example.com/Path"
        );
    }

    #[test]
    fn test_notification_from_frame() {
        assert_eq!(
            RelayNotification::from_frame(RelayMessage::eose("s")),
            Some(RelayNotification::EndOfStoredEvents)
        );
        match RelayNotification::from_frame(RelayMessage::closed("s", "auth-required: x")) {
            Some(RelayNotification::Closed(reason)) => {
                assert_eq!(reason.prefix, ClosedPrefix::AuthRequired)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(RelayNotification::from_frame(RelayMessage::Ok {
            event_id: "e".into(),
            accepted: true,
            message: String::new(),
        })
        .is_none());
    }
}
