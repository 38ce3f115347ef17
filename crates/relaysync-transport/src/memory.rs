//! In-memory relay.
//!
//! Speaks the real wire codec through an in-process channel, which makes it
//! useful both for tests and for running the sync layer fully offline.
//! Supports delayed end-of-stored-events, live publishing, relays that demand
//! authentication, and failure injection.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use relaysync_protocol::{codec, ClientMessage, Event, Filter, RelayMessage};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::traits::{RelayNotification, RelayStream, RelayTransport, RelayUrl, SubscriptionId};
use crate::TransportError;

/// An in-memory relay.
///
/// Clones share the same relay state, so a test can keep a handle while the
/// pool owns another.
#[derive(Clone)]
pub struct MemoryRelay {
    url: RelayUrl,
    inner: Arc<Mutex<MemoryRelayInner>>,
}

#[derive(Default)]
struct MemoryRelayInner {
    stored: Vec<Event>,
    subscriptions: HashMap<String, OpenSubscription>,
    eose_delay: Option<Duration>,
    require_auth: bool,
    authenticated: bool,
    healthy: bool,
    fail_next_subscribe: Option<String>,
    requests: Vec<ClientMessage>,
    challenge_counter: u64,
}

struct OpenSubscription {
    filters: Vec<Filter>,
    sender: mpsc::UnboundedSender<Bytes>,
}

impl MemoryRelay {
    /// Create an empty relay.
    #[must_use]
    pub fn new(url: impl AsRef<str>) -> Self {
        Self {
            url: RelayUrl::new(url),
            inner: Arc::new(Mutex::new(MemoryRelayInner {
                healthy: true,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryRelayInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed stored events.
    #[must_use]
    pub fn with_events(self, events: impl IntoIterator<Item = Event>) -> Self {
        self.lock().stored.extend(events);
        self
    }

    /// Delay the end-of-stored-events frame of every new subscription.
    #[must_use]
    pub fn with_eose_delay(self, delay: Duration) -> Self {
        self.lock().eose_delay = Some(delay);
        self
    }

    /// Require authentication before serving subscriptions.
    #[must_use]
    pub fn requiring_auth(self) -> Self {
        self.lock().require_auth = true;
        self
    }

    /// Accept the client's authentication.
    pub fn accept_auth(&self) {
        self.lock().authenticated = true;
        debug!(relay = %self.url, "Memory relay accepted authentication");
    }

    /// Invalidate the client's session, closing every open subscription
    /// with an `auth-required` reason.
    pub fn revoke_auth(&self) {
        let mut inner = self.lock();
        inner.authenticated = false;
        for (id, sub) in inner.subscriptions.drain() {
            send_frame(
                &sub.sender,
                &RelayMessage::closed(id, "auth-required: session expired"),
            );
        }
    }

    /// Drop every open subscription without a CLOSED frame, like a dropped
    /// connection.
    pub fn disconnect(&self) {
        self.lock().subscriptions.clear();
    }

    /// Cause the next `subscribe()` to fail with the given error.
    pub fn fail_next_subscribe(&self, error: &str) {
        self.lock().fail_next_subscribe = Some(error.to_string());
    }

    /// Mark the relay healthy or unhealthy.
    pub fn set_healthy(&self, healthy: bool) {
        self.lock().healthy = healthy;
    }

    /// Store an event and push it to every open subscription it matches.
    ///
    /// Returns the number of subscriptions the event was pushed to.
    pub fn publish(&self, event: Event) -> usize {
        let mut inner = self.lock();
        if !inner.stored.iter().any(|e| e.id == event.id) {
            inner.stored.push(event.clone());
        }
        let mut delivered = 0;
        for (id, sub) in &inner.subscriptions {
            if sub.filters.iter().any(|f| f.matches(&event)) {
                send_frame(&sub.sender, &RelayMessage::event(id.clone(), event.clone()));
                delivered += 1;
            }
        }
        trace!(relay = %self.url, event = %event.id, delivered, "Published live event");
        delivered
    }

    /// All client frames received so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<ClientMessage> {
        self.lock().requests.clone()
    }

    /// Number of REQ frames received.
    #[must_use]
    pub fn req_count(&self) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| matches!(r, ClientMessage::Req { .. }))
            .count()
    }

    /// Number of subscriptions currently open.
    #[must_use]
    pub fn open_subscriptions(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Number of stored events.
    #[must_use]
    pub fn stored_len(&self) -> usize {
        self.lock().stored.len()
    }

    fn receive(&self, inner: &mut MemoryRelayInner, frame: &ClientMessage) -> Result<(), TransportError> {
        // Round-trip through the codec so the relay sees exactly what a
        // socket would carry.
        let bytes = codec::encode_client(frame)?;
        let decoded: ClientMessage = codec::decode(&bytes)?;
        inner.requests.push(decoded);
        Ok(())
    }
}

fn send_frame(sender: &mpsc::UnboundedSender<Bytes>, frame: &RelayMessage) {
    match codec::encode(frame) {
        Ok(bytes) => {
            let _ = sender.send(bytes);
        }
        Err(e) => warn!(error = %e, "Failed to encode relay frame"),
    }
}

/// Stored events matching any filter, newest first, each filter's limit
/// applied to its own matches.
fn stored_matches(stored: &[Event], filters: &[Filter]) -> Vec<Event> {
    let mut sorted: Vec<&Event> = stored.iter().collect();
    sorted.sort_by(|a, b| a.feed_order(b));

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for filter in filters {
        let matches = sorted.iter().filter(|e| filter.matches(e));
        let limited: Box<dyn Iterator<Item = &&Event>> = match filter.limit {
            Some(limit) => Box::new(matches.take(limit)),
            None => Box::new(matches),
        };
        for ev in limited {
            if seen.insert(ev.id.clone()) {
                out.push((*ev).clone());
            }
        }
    }
    out.sort_by(|a, b| a.feed_order(b));
    out
}

fn notification_stream(receiver: mpsc::UnboundedReceiver<Bytes>, url: RelayUrl) -> RelayStream {
    stream::unfold(receiver, |mut rx| async move {
        let bytes = rx.recv().await?;
        Some((bytes, rx))
    })
    .filter_map(move |bytes| {
        let url = url.clone();
        async move {
            match codec::decode_relay(&bytes) {
                Ok(frame) => RelayNotification::from_frame(frame),
                Err(e) => {
                    warn!(relay = %url, error = %e, "Dropping malformed relay frame");
                    None
                }
            }
        }
    })
    .boxed()
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    fn url(&self) -> &RelayUrl {
        &self.url
    }

    async fn subscribe(
        &self,
        id: &SubscriptionId,
        filters: Vec<Filter>,
    ) -> Result<RelayStream, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.lock();

        if let Some(error) = inner.fail_next_subscribe.take() {
            return Err(TransportError::Unreachable(error));
        }

        self.receive(&mut inner, &ClientMessage::req(id.as_str(), filters.clone()))?;

        if inner.require_auth && !inner.authenticated {
            inner.challenge_counter += 1;
            let challenge = format!("challenge-{}", inner.challenge_counter);
            debug!(relay = %self.url, subscription = %id, "Memory relay demands authentication");
            send_frame(&sender, &RelayMessage::auth(challenge));
            send_frame(
                &sender,
                &RelayMessage::closed(id.as_str(), "auth-required: authenticate first"),
            );
            return Ok(notification_stream(receiver, self.url.clone()));
        }

        for event in stored_matches(&inner.stored, &filters) {
            send_frame(&sender, &RelayMessage::event(id.as_str(), event));
        }

        match inner.eose_delay {
            Some(delay) => {
                let eose_sender = sender.clone();
                let sub_id = id.as_str().to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    send_frame(&eose_sender, &RelayMessage::eose(sub_id));
                });
            }
            None => send_frame(&sender, &RelayMessage::eose(id.as_str())),
        }

        inner
            .subscriptions
            .insert(id.as_str().to_string(), OpenSubscription { filters, sender });
        debug!(relay = %self.url, subscription = %id, "Memory relay opened subscription");

        Ok(notification_stream(receiver, self.url.clone()))
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), TransportError> {
        let mut inner = self.lock();
        self.receive(&mut inner, &ClientMessage::close(id.as_str()))?;
        if inner.subscriptions.remove(id.as_str()).is_some() {
            debug!(relay = %self.url, subscription = %id, "Memory relay closed subscription");
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.lock().healthy
    }
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRelay").field("url", &self.url).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaysync_protocol::ClosedPrefix;

    fn video(id: &str, author: &str, at: u64) -> Event {
        Event::new(id, author, 22, at)
    }

    #[tokio::test]
    async fn test_stored_then_eose_then_live() {
        let relay = MemoryRelay::new("wss://mem.example")
            .with_events([video("a", "alice", 10), video("b", "bob", 20)]);
        let mut stream = relay
            .subscribe(&"s1".into(), vec![Filter::new().kind(22)])
            .await
            .unwrap();

        assert_eq!(stream.next().await, Some(RelayNotification::Event(video("b", "bob", 20))));
        assert_eq!(stream.next().await, Some(RelayNotification::Event(video("a", "alice", 10))));
        assert_eq!(stream.next().await, Some(RelayNotification::EndOfStoredEvents));

        assert_eq!(relay.publish(video("c", "carol", 30)), 1);
        assert_eq!(stream.next().await, Some(RelayNotification::Event(video("c", "carol", 30))));
    }

    #[tokio::test]
    async fn test_limit_and_filter_respected() {
        let relay = MemoryRelay::new("wss://mem.example").with_events([
            video("a", "alice", 10),
            video("b", "alice", 20),
            video("c", "bob", 30),
        ]);
        let mut stream = relay
            .subscribe(&"s1".into(), vec![Filter::new().author("alice").limit(1)])
            .await
            .unwrap();

        assert_eq!(stream.next().await, Some(RelayNotification::Event(video("b", "alice", 20))));
        assert_eq!(stream.next().await, Some(RelayNotification::EndOfStoredEvents));
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_stream() {
        let relay = MemoryRelay::new("wss://mem.example");
        let id = SubscriptionId::new("s1");
        let mut stream = relay.subscribe(&id, vec![Filter::new()]).await.unwrap();
        assert_eq!(stream.next().await, Some(RelayNotification::EndOfStoredEvents));

        relay.unsubscribe(&id).await.unwrap();
        assert_eq!(relay.open_subscriptions(), 0);
        assert_eq!(stream.next().await, None);
        assert_eq!(relay.requests().last(), Some(&ClientMessage::close("s1")));
    }

    #[tokio::test]
    async fn test_auth_required() {
        let relay = MemoryRelay::new("wss://mem.example").requiring_auth();
        let mut stream = relay.subscribe(&"s1".into(), vec![Filter::new()]).await.unwrap();

        assert!(matches!(stream.next().await, Some(RelayNotification::AuthChallenge(_))));
        match stream.next().await {
            Some(RelayNotification::Closed(reason)) => {
                assert_eq!(reason.prefix, ClosedPrefix::AuthRequired)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(stream.next().await, None);

        relay.accept_auth();
        let mut stream = relay.subscribe(&"s2".into(), vec![Filter::new()]).await.unwrap();
        assert_eq!(stream.next().await, Some(RelayNotification::EndOfStoredEvents));
        assert_eq!(relay.req_count(), 2);
    }

    #[tokio::test]
    async fn test_fail_next_subscribe() {
        let relay = MemoryRelay::new("wss://mem.example");
        relay.fail_next_subscribe("refused");
        assert!(matches!(
            relay.subscribe(&"s1".into(), vec![Filter::new()]).await,
            Err(TransportError::Unreachable(_))
        ));
        assert!(relay.subscribe(&"s2".into(), vec![Filter::new()]).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eose_delay() {
        let relay = MemoryRelay::new("wss://mem.example")
            .with_events([video("a", "alice", 10)])
            .with_eose_delay(Duration::from_millis(100));
        let mut stream = relay.subscribe(&"s1".into(), vec![Filter::new()]).await.unwrap();

        assert!(matches!(stream.next().await, Some(RelayNotification::Event(_))));
        let started = tokio::time::Instant::now();
        assert_eq!(stream.next().await, Some(RelayNotification::EndOfStoredEvents));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
