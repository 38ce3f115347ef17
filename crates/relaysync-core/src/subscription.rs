//! Subscription manager.
//!
//! Owns every live relay query. Requests with structurally identical filter
//! sets share one relay-side subscription; each caller is a reference-counted
//! listener with its own typed receiver. The relay query is released when the
//! last listener cancels.
//!
//! ```text
//!  open(A) ─┐                       ┌─▶ listener A
//!           ├─▶ key ─▶ Entry ─▶ relay drivers ──┤
//!  open(B) ─┘                       └─▶ listener B
//! ```

use futures_util::StreamExt;
use relaysync_protocol::{Event, Filter, FilterSetKey};
use relaysync_transport::{
    RelayNotification, RelayPool, RelayTransport, RelayUrl, SubscriptionId,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::auth::{AuthStatus, AuthTracker};
use crate::config::{AuthConfig, SubscriptionConfig};
use crate::error::SyncError;
use crate::metrics;

/// Finished subscriptions remembered for [`SubscriptionManager::state`].
const FINISHED_HISTORY: usize = 256;

/// Upper bound on events kept for listeners that join a running subscription.
const REPLAY_CAP: usize = 1024;

/// Identifier of one caller attached to a subscription.
pub type ListenerId = u64;

/// Shedding priority. Lower priorities are cancelled first under load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Background work.
    Low,
    /// Regular feeds.
    #[default]
    Normal,
    /// Whatever the user is looking at.
    High,
}

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    /// Registered, relay queries not yet issued.
    Created,
    /// Relay queries running.
    Active,
    /// Last listener cancelled.
    Completed,
    /// Shed under load.
    Cancelled,
    /// Timed out, or every relay failed.
    Errored,
}

impl SubscriptionState {
    /// Check if the subscription has finished.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubscriptionState::Completed | SubscriptionState::Cancelled | SubscriptionState::Errored
        )
    }
}

/// What a listener receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// An event from one relay.
    Event {
        /// Relay the event came from.
        relay: RelayUrl,
        /// The event.
        event: Event,
    },
    /// Every relay has finished replaying stored events.
    EndOfStoredEvents,
    /// Something went wrong. Relay errors leave the subscription running
    /// on the remaining relays.
    Error(SyncError),
}

/// A caller's claim on a subscription. Pass it back to
/// [`SubscriptionManager::cancel`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    /// Shared subscription.
    pub subscription: SubscriptionId,
    /// This caller.
    pub listener: ListenerId,
}

/// Receiver half handed to a listener.
pub type SubscriptionReceiver = mpsc::UnboundedReceiver<SubscriptionEvent>;

/// Parameters of [`SubscriptionManager::open`].
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    /// Name for logs and errors.
    pub name: String,
    /// Filter set.
    pub filters: Vec<Filter>,
    /// Shedding priority.
    pub priority: Priority,
    /// Time allowed before the first activity. Manager default when `None`.
    pub timeout: Option<Duration>,
}

impl SubscriptionRequest {
    /// Create a request with normal priority and the default timeout.
    #[must_use]
    pub fn new(name: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            name: name.into(),
            filters,
            priority: Priority::Normal,
            timeout: None,
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the activity timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Active subscription cap.
    pub max_concurrent: usize,
    /// Activity timeout when a request has none.
    pub default_timeout: Duration,
    /// How long a request queued behind an auth handshake waits.
    pub auth_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from_config(&SubscriptionConfig::default(), &AuthConfig::default())
    }
}

impl ManagerConfig {
    /// Build from the loaded configuration sections.
    #[must_use]
    pub fn from_config(subscriptions: &SubscriptionConfig, auth: &AuthConfig) -> Self {
        Self {
            max_concurrent: subscriptions.max_concurrent.max(1),
            default_timeout: subscriptions.default_timeout(),
            auth_timeout: auth.timeout(),
        }
    }
}

/// Manager statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    /// Subscriptions currently active.
    pub active: usize,
    /// Listeners across all subscriptions.
    pub listeners: usize,
    /// Relay streams currently driven.
    pub relay_streams: usize,
}

struct Entry {
    name: String,
    key: FilterSetKey,
    priority: Priority,
    seq: u64,
    state: SubscriptionState,
    listeners: HashMap<ListenerId, mpsc::UnboundedSender<SubscriptionEvent>>,
    relays: Vec<Arc<dyn RelayTransport>>,
    drivers: HashMap<RelayUrl, JoinHandle<()>>,
    pending_eose: HashSet<RelayUrl>,
    eose_sent: bool,
    active: bool,
    awaiting_auth: usize,
    replay: VecDeque<(RelayUrl, Event)>,
    replay_cap: usize,
    timeout: Duration,
    watchdog: Option<JoinHandle<()>>,
}

impl Entry {
    /// Send to every listener, dropping those whose receiver is gone.
    fn broadcast(&mut self, event: &SubscriptionEvent) {
        self.listeners.retain(|id, tx| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                trace!(listener = id, "Pruned dropped listener");
            }
            alive
        });
    }

    /// Remember a delivered event for listeners that join later.
    fn record(&mut self, relay: &RelayUrl, event: &Event) {
        if self.replay_cap == 0 {
            return;
        }
        if self.replay.len() == self.replay_cap {
            self.replay.pop_front();
        }
        self.replay.push_back((relay.clone(), event.clone()));
    }

    /// Attach a listener, catching it up on everything delivered so far.
    fn join(&mut self, listener: ListenerId, tx: mpsc::UnboundedSender<SubscriptionEvent>) {
        for (relay, event) in &self.replay {
            let _ = tx.send(SubscriptionEvent::Event {
                relay: relay.clone(),
                event: event.clone(),
            });
        }
        if self.eose_sent {
            let _ = tx.send(SubscriptionEvent::EndOfStoredEvents);
        }
        self.listeners.insert(listener, tx);
    }

    fn settle_eose(&mut self) {
        if !self.eose_sent && self.pending_eose.is_empty() {
            self.eose_sent = true;
            self.broadcast(&SubscriptionEvent::EndOfStoredEvents);
        }
    }
}

#[derive(Default)]
struct Table {
    by_key: HashMap<FilterSetKey, SubscriptionId>,
    subs: HashMap<SubscriptionId, Entry>,
    finished: VecDeque<(SubscriptionId, SubscriptionState)>,
}

impl Table {
    /// Remove a subscription and stop its tasks. The relay-side CLOSE is
    /// left to the returned [`Release`].
    fn teardown(
        &mut self,
        id: &SubscriptionId,
        state: SubscriptionState,
        notice: Option<SubscriptionEvent>,
    ) -> Option<Release> {
        let mut entry = self.subs.remove(id)?;
        if self.by_key.get(&entry.key) == Some(id) {
            self.by_key.remove(&entry.key);
        }
        if let Some(notice) = notice {
            entry.broadcast(&notice);
        }
        for (_, driver) in entry.drivers.drain() {
            driver.abort();
        }
        if let Some(watchdog) = entry.watchdog.take() {
            watchdog.abort();
        }

        self.finished.push_back((id.clone(), state));
        while self.finished.len() > FINISHED_HISTORY {
            self.finished.pop_front();
        }
        metrics::set_active_subscriptions(self.subs.len());
        debug!(subscription = %id, name = %entry.name, ?state, "Subscription finished");

        Some(Release {
            id: id.clone(),
            relays: entry.relays,
        })
    }

    /// Oldest subscription with the lowest priority below `priority`.
    fn shed_candidate(&self, priority: Priority) -> Option<SubscriptionId> {
        self.subs
            .iter()
            .filter(|(_, e)| e.priority < priority)
            .min_by_key(|(_, e)| (e.priority, e.seq))
            .map(|(id, _)| id.clone())
    }
}

/// Relay-side cleanup of a torn-down subscription.
struct Release {
    id: SubscriptionId,
    relays: Vec<Arc<dyn RelayTransport>>,
}

impl Release {
    async fn run(self) {
        for relay in &self.relays {
            if let Err(e) = relay.unsubscribe(&self.id).await {
                debug!(relay = %relay.url(), subscription = %self.id, error = %e, "Unsubscribe failed");
            }
        }
    }

    /// Run on a separate task. Used from tasks the teardown itself aborts.
    fn spawn(self) {
        tokio::spawn(self.run());
    }
}

struct Inner {
    pool: RelayPool,
    auth: Arc<AuthTracker>,
    config: ManagerConfig,
    table: Mutex<Table>,
    next_id: AtomicU64,
    next_listener: AtomicU64,
}

/// Deduplicating owner of relay subscriptions.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    /// Create a manager over a relay pool.
    #[must_use]
    pub fn new(pool: RelayPool, auth: Arc<AuthTracker>, config: ManagerConfig) -> Self {
        info!(relays = pool.len(), max_concurrent = config.max_concurrent, "Creating subscription manager");
        Self {
            inner: Arc::new(Inner {
                pool,
                auth,
                config,
                table: Mutex::new(Table::default()),
                next_id: AtomicU64::new(1),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// The relay pool.
    #[must_use]
    pub fn pool(&self) -> &RelayPool {
        &self.inner.pool
    }

    /// The auth tracker used to gate relay queries.
    #[must_use]
    pub fn auth(&self) -> &Arc<AuthTracker> {
        &self.inner.auth
    }

    /// Open a subscription, or join an equivalent one.
    ///
    /// If an active subscription has a structurally identical filter set the
    /// caller is attached to it and no relay query is issued. Otherwise a new
    /// query goes out to every healthy relay.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidFilter`] for an empty or malformed filter
    /// set, and [`SyncError::SubscriptionLimit`] when the cap is reached and
    /// no lower-priority subscription can be shed.
    pub async fn open(
        &self,
        request: SubscriptionRequest,
    ) -> Result<(SubscriptionHandle, SubscriptionReceiver), SyncError> {
        if request.filters.is_empty() {
            return Err(SyncError::InvalidFilter("empty filter set".to_string()));
        }
        for filter in &request.filters {
            filter.validate()?;
        }

        let key = FilterSetKey::new(&request.filters);
        let listener = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut table = self.inner.table.lock().await;

        if let Some(id) = table.by_key.get(&key).cloned() {
            if let Some(entry) = table.subs.get_mut(&id) {
                entry.join(listener, tx);
                entry.priority = entry.priority.max(request.priority);
                metrics::record_subscription_reused();
                debug!(
                    subscription = %id,
                    name = %request.name,
                    listeners = entry.listeners.len(),
                    replayed = entry.replay.len(),
                    "Joined existing subscription"
                );
                return Ok((SubscriptionHandle { subscription: id, listener }, rx));
            }
        }

        let mut shed = None;
        if table.subs.len() >= self.inner.config.max_concurrent {
            let Some(victim) = table.shed_candidate(request.priority) else {
                warn!(name = %request.name, "Subscription limit reached");
                metrics::record_error("subscription_limit");
                return Err(SyncError::SubscriptionLimit(self.inner.config.max_concurrent));
            };
            let victim_name = table.subs.get(&victim).map(|e| e.name.clone()).unwrap_or_default();
            info!(subscription = %victim, name = %victim_name, "Shedding subscription");
            metrics::record_subscription_shed();
            shed = table.teardown(
                &victim,
                SubscriptionState::Cancelled,
                Some(SubscriptionEvent::Error(SyncError::Shed(victim_name))),
            );
        }

        let seq = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let id = SubscriptionId::new(format!("rs-{seq}"));
        let timeout = request.timeout.unwrap_or(self.inner.config.default_timeout);
        let relays = self.inner.pool.healthy();

        let mut entry = Entry {
            name: request.name.clone(),
            key: key.clone(),
            priority: request.priority,
            seq,
            state: SubscriptionState::Created,
            listeners: HashMap::from([(listener, tx)]),
            relays: relays.clone(),
            drivers: HashMap::new(),
            pending_eose: relays.iter().map(|r| r.url().clone()).collect(),
            eose_sent: false,
            active: false,
            awaiting_auth: 0,
            replay: VecDeque::new(),
            replay_cap: replay_cap(&request.filters, relays.len()),
            timeout,
            watchdog: None,
        };

        for relay in relays {
            let url = relay.url().clone();
            let driver = tokio::spawn(drive_relay(
                Arc::clone(&self.inner),
                id.clone(),
                relay,
                request.filters.clone(),
            ));
            entry.drivers.insert(url, driver);
        }
        if entry.drivers.is_empty() {
            entry.active = true;
            entry.settle_eose();
        }
        entry.watchdog = Some(tokio::spawn(watchdog(
            Arc::clone(&self.inner),
            id.clone(),
            timeout,
        )));
        entry.state = SubscriptionState::Active;

        debug!(
            subscription = %id,
            name = %request.name,
            key = %key,
            relays = entry.drivers.len(),
            "Opened subscription"
        );
        table.by_key.insert(key, id.clone());
        table.subs.insert(id.clone(), entry);
        metrics::record_subscription_opened();
        metrics::set_active_subscriptions(table.subs.len());
        drop(table);

        if let Some(release) = shed {
            release.run().await;
        }
        Ok((SubscriptionHandle { subscription: id, listener }, rx))
    }

    /// Detach a caller.
    ///
    /// When the last caller detaches the relay queries are closed and the
    /// subscription is marked `Completed`. Cancelling twice, or cancelling a
    /// finished subscription, does nothing.
    pub async fn cancel(&self, handle: &SubscriptionHandle) {
        let mut table = self.inner.table.lock().await;
        let Some(entry) = table.subs.get_mut(&handle.subscription) else {
            return;
        };
        if entry.listeners.remove(&handle.listener).is_none() {
            return;
        }
        trace!(
            subscription = %handle.subscription,
            listener = handle.listener,
            remaining = entry.listeners.len(),
            "Listener detached"
        );
        if !entry.listeners.is_empty() {
            return;
        }
        let release = table.teardown(&handle.subscription, SubscriptionState::Completed, None);
        drop(table);
        if let Some(release) = release {
            release.run().await;
        }
    }

    /// State of a subscription, including recently finished ones.
    pub async fn state(&self, id: &SubscriptionId) -> Option<SubscriptionState> {
        let table = self.inner.table.lock().await;
        if let Some(entry) = table.subs.get(id) {
            return Some(entry.state);
        }
        table
            .finished
            .iter()
            .rev()
            .find(|(finished, _)| finished == id)
            .map(|(_, state)| *state)
    }

    /// Number of listeners attached to a subscription.
    pub async fn listener_count(&self, id: &SubscriptionId) -> usize {
        self.inner
            .table
            .lock()
            .await
            .subs
            .get(id)
            .map_or(0, |e| e.listeners.len())
    }

    /// Get manager statistics.
    pub async fn stats(&self) -> ManagerStats {
        let table = self.inner.table.lock().await;
        ManagerStats {
            active: table.subs.len(),
            listeners: table.subs.values().map(|e| e.listeners.len()).sum(),
            relay_streams: table.subs.values().map(|e| e.drivers.len()).sum(),
        }
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("pool", &self.inner.pool)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Inner {
    /// Forward an event. Returns `false` once the subscription is gone.
    async fn deliver(&self, id: &SubscriptionId, relay: &RelayUrl, event: Event) -> bool {
        let mut table = self.table.lock().await;
        let Some(entry) = table.subs.get_mut(id) else {
            return false;
        };
        entry.active = true;
        entry.record(relay, &event);
        entry.broadcast(&SubscriptionEvent::Event {
            relay: relay.clone(),
            event,
        });
        if entry.listeners.is_empty() {
            if let Some(release) = table.teardown(id, SubscriptionState::Completed, None) {
                release.spawn();
            }
            return false;
        }
        true
    }

    async fn relay_eose(&self, id: &SubscriptionId, relay: &RelayUrl) {
        let mut table = self.table.lock().await;
        let Some(entry) = table.subs.get_mut(id) else {
            return;
        };
        entry.active = true;
        entry.pending_eose.remove(relay);
        trace!(subscription = %id, relay = %relay, pending = entry.pending_eose.len(), "Relay EOSE");
        entry.settle_eose();
        if entry.listeners.is_empty() {
            if let Some(release) = table.teardown(id, SubscriptionState::Completed, None) {
                release.spawn();
            }
        }
    }

    /// A relay stopped serving this subscription. The error goes to every
    /// listener; the subscription ends once no relay is left.
    async fn relay_failed(&self, id: &SubscriptionId, relay: &RelayUrl, error: SyncError) {
        let mut table = self.table.lock().await;
        let Some(entry) = table.subs.get_mut(id) else {
            return;
        };
        warn!(subscription = %id, relay = %relay, error = %error, "Relay stream failed");
        metrics::record_error(error.kind());

        entry.active = true;
        entry.drivers.remove(relay);
        entry.pending_eose.remove(relay);
        entry.broadcast(&SubscriptionEvent::Error(error));
        entry.settle_eose();

        if entry.drivers.is_empty() || entry.listeners.is_empty() {
            let state = if entry.listeners.is_empty() {
                SubscriptionState::Completed
            } else {
                SubscriptionState::Errored
            };
            if let Some(release) = table.teardown(id, state, None) {
                release.spawn();
            }
        }
    }

    async fn auth_wait_started(&self, id: &SubscriptionId) {
        if let Some(entry) = self.table.lock().await.subs.get_mut(id) {
            entry.awaiting_auth += 1;
        }
    }

    /// The handshake completed. The activity timeout starts over from here.
    async fn auth_wait_finished(self: &Arc<Self>, id: &SubscriptionId) {
        let mut table = self.table.lock().await;
        let Some(entry) = table.subs.get_mut(id) else {
            return;
        };
        entry.awaiting_auth = entry.awaiting_auth.saturating_sub(1);
        if entry.awaiting_auth > 0 || entry.active {
            return;
        }
        if let Some(previous) = entry.watchdog.take() {
            previous.abort();
        }
        entry.watchdog = Some(tokio::spawn(watchdog(
            Arc::clone(self),
            id.clone(),
            entry.timeout,
        )));
    }

    /// Tear down a subscription that saw no relay activity. Requests queued
    /// behind an auth handshake are bounded by the auth timeout instead.
    async fn timed_out(&self, id: &SubscriptionId, timeout: Duration) {
        let mut table = self.table.lock().await;
        let Some(entry) = table.subs.get(id) else {
            return;
        };
        if entry.active {
            return;
        }
        if entry.awaiting_auth > 0 {
            trace!(subscription = %id, "Activity timeout deferred while authenticating");
            return;
        }
        let name = entry.name.clone();
        info!(subscription = %id, name = %name, ?timeout, "Subscription timed out");
        metrics::record_subscription_timeout();
        metrics::record_error("timeout");
        let release = table.teardown(
            id,
            SubscriptionState::Errored,
            Some(SubscriptionEvent::Error(SyncError::Timeout { name, timeout })),
        );
        if let Some(release) = release {
            release.spawn();
        }
    }
}

async fn watchdog(inner: Arc<Inner>, id: SubscriptionId, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    inner.timed_out(&id, timeout).await;
}

/// Replay buffer size: the filters' combined limit per relay, or
/// [`REPLAY_CAP`] when a filter is unbounded.
fn replay_cap(filters: &[Filter], relays: usize) -> usize {
    filters
        .iter()
        .map(|f| f.limit)
        .sum::<Option<usize>>()
        .map_or(REPLAY_CAP, |limit| limit.saturating_mul(relays.max(1)).min(REPLAY_CAP))
}

/// Drive one relay's stream for one subscription.
///
/// A relay that closes the query with `auth-required` while we hold no
/// session is reissued exactly once after the handshake completes, or
/// straight away if the handshake finished while the query was in flight. A
/// relay that does so while we believed we had a session has rejected it;
/// that is surfaced and left to the caller.
async fn drive_relay(
    inner: Arc<Inner>,
    id: SubscriptionId,
    relay: Arc<dyn RelayTransport>,
    filters: Vec<Filter>,
) {
    let url = relay.url().clone();
    let mut reissued = false;

    loop {
        if inner.auth.status(&url) == AuthStatus::Challenged {
            debug!(subscription = %id, relay = %url, "Waiting for authentication");
            inner.auth_wait_started(&id).await;
            if let Err(e) = inner
                .auth
                .await_authentication(&url, inner.config.auth_timeout)
                .await
            {
                inner.relay_failed(&id, &url, e).await;
                return;
            }
            inner.auth_wait_finished(&id).await;
        }

        let had_session = inner.auth.status(&url) == AuthStatus::Authenticated;
        let mut stream = match relay.subscribe(&id, filters.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(auth_err) = inner.auth.on_failure(&url).await {
                    debug!(relay = %url, error = %auth_err, "Auth state flush failed");
                }
                inner.relay_failed(&id, &url, SyncError::transport(&url, e)).await;
                return;
            }
        };

        let mut auth_required = false;
        while let Some(notification) = stream.next().await {
            match notification {
                RelayNotification::Event(event) => {
                    if !inner.deliver(&id, &url, event).await {
                        return;
                    }
                }
                RelayNotification::EndOfStoredEvents => inner.relay_eose(&id, &url).await,
                RelayNotification::AuthChallenge(challenge) => {
                    if let Err(e) = inner.auth.on_challenge(&url, Some(challenge)).await {
                        debug!(relay = %url, error = %e, "Auth state flush failed");
                    }
                }
                RelayNotification::Closed(reason) if reason.requires_auth() => {
                    auth_required = true;
                    break;
                }
                RelayNotification::Closed(reason) => {
                    inner
                        .relay_failed(&id, &url, SyncError::transport(&url, format!("closed: {reason}")))
                        .await;
                    return;
                }
                RelayNotification::Notice(message) => {
                    debug!(relay = %url, notice = %message, "Relay notice");
                }
            }
        }

        if !auth_required {
            inner
                .relay_failed(&id, &url, SyncError::transport(&url, "stream ended"))
                .await;
            return;
        }

        let status = inner.auth.status(&url);
        if had_session || reissued {
            // A session that was valid when the stream opened is gone, even
            // if the relay already issued a fresh challenge.
            let flushed = if had_session && !reissued {
                inner.auth.reset(&url).await
            } else {
                inner.auth.on_rejected(&url).await
            };
            if let Err(e) = flushed {
                debug!(relay = %url, error = %e, "Auth state flush failed");
            }
            inner
                .relay_failed(&id, &url, SyncError::AuthRejected(url.clone()))
                .await;
            return;
        }

        reissued = true;
        if status == AuthStatus::Authenticated {
            debug!(subscription = %id, relay = %url, "Authenticated while in flight, reissuing");
            continue;
        }
        if status != AuthStatus::Challenged {
            if let Err(e) = inner.auth.on_challenge(&url, None).await {
                debug!(relay = %url, error = %e, "Auth state flush failed");
            }
        }
        debug!(subscription = %id, relay = %url, "Relay requires authentication, queued for reissue");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryAuthStore;
    use async_trait::async_trait;
    use futures_util::stream;
    use relaysync_protocol::{kind, ClosedReason};
    use relaysync_transport::{MemoryRelay, RelayStream, TransportError};
    use std::sync::atomic::AtomicUsize;

    /// Relay whose handshake completes while its `auth-required` CLOSED is
    /// still in flight. The second query serves one event.
    struct InFlightAuthRelay {
        url: RelayUrl,
        auth: Arc<AuthTracker>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RelayTransport for InFlightAuthRelay {
        fn url(&self) -> &RelayUrl {
            &self.url
        }

        async fn subscribe(
            &self,
            _id: &SubscriptionId,
            _filters: Vec<Filter>,
        ) -> Result<RelayStream, TransportError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                return Ok(stream::iter([
                    RelayNotification::Event(video("secret", "alice", 10)),
                    RelayNotification::EndOfStoredEvents,
                ])
                .chain(stream::pending())
                .boxed());
            }
            let auth = Arc::clone(&self.auth);
            let url = self.url.clone();
            Ok(stream::iter([
                RelayNotification::AuthChallenge("challenge-1".to_string()),
                RelayNotification::Closed(ClosedReason::parse("auth-required: authenticate first")),
            ])
            .then(move |notification| {
                let auth = Arc::clone(&auth);
                let url = url.clone();
                async move {
                    if matches!(notification, RelayNotification::Closed(_)) {
                        auth.on_authenticated(&url).await.unwrap();
                    }
                    notification
                }
            })
            .boxed())
        }

        async fn unsubscribe(&self, _id: &SubscriptionId) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn video(id: &str, author: &str, at: u64) -> Event {
        Event::new(id, author, kind::SHORT_VIDEO, at)
    }

    fn manager_with(relays: &[MemoryRelay], config: ManagerConfig) -> SubscriptionManager {
        let pool = RelayPool::with_relays(
            relays
                .iter()
                .map(|r| Arc::new(r.clone()) as Arc<dyn RelayTransport>)
                .collect(),
        );
        let auth = Arc::new(AuthTracker::new(Arc::new(MemoryAuthStore::new())));
        SubscriptionManager::new(pool, auth, config)
    }

    fn manager(relays: &[MemoryRelay]) -> SubscriptionManager {
        manager_with(relays, ManagerConfig::default())
    }

    fn videos() -> Vec<Filter> {
        vec![Filter::new().kind(kind::SHORT_VIDEO)]
    }

    async fn next(rx: &mut SubscriptionReceiver) -> SubscriptionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for subscription event")
            .expect("subscription channel closed")
    }

    #[tokio::test]
    async fn test_open_delivers_events_then_eose() {
        let relay = MemoryRelay::new("wss://one.example").with_events([video("a", "alice", 10)]);
        let manager = manager(&[relay.clone()]);

        let (_handle, mut rx) = manager
            .open(SubscriptionRequest::new("feed", videos()))
            .await
            .unwrap();

        match next(&mut rx).await {
            SubscriptionEvent::Event { relay: url, event } => {
                assert_eq!(url, RelayUrl::new("wss://one.example"));
                assert_eq!(event.id, "a");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(next(&mut rx).await, SubscriptionEvent::EndOfStoredEvents);
    }

    #[tokio::test]
    async fn test_equivalent_filters_share_relay_query() {
        let relay = MemoryRelay::new("wss://one.example");
        let manager = manager(&[relay.clone()]);

        let (a, mut rx_a) = manager
            .open(SubscriptionRequest::new("a", vec![Filter::new().kinds([22, 21]).limit(10)]))
            .await
            .unwrap();
        let (b, mut rx_b) = manager
            .open(SubscriptionRequest::new("b", vec![Filter::new().kinds([21, 22]).limit(50)]))
            .await
            .unwrap();

        assert_eq!(a.subscription, b.subscription);
        assert_ne!(a.listener, b.listener);
        assert_eq!(manager.listener_count(&a.subscription).await, 2);
        assert_eq!(next(&mut rx_a).await, SubscriptionEvent::EndOfStoredEvents);
        assert_eq!(next(&mut rx_b).await, SubscriptionEvent::EndOfStoredEvents);
        assert_eq!(relay.req_count(), 1);

        manager.cancel(&a).await;
        assert_eq!(manager.state(&b.subscription).await, Some(SubscriptionState::Active));
        assert_eq!(relay.publish(video("live", "alice", 99)), 1);
        assert!(matches!(next(&mut rx_b).await, SubscriptionEvent::Event { .. }));

        manager.cancel(&b).await;
        assert_eq!(manager.state(&b.subscription).await, Some(SubscriptionState::Completed));
        assert_eq!(relay.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_distinct_author_filters_not_merged() {
        let relay = MemoryRelay::new("wss://one.example");
        let manager = manager(&[relay.clone()]);

        let (all, _rx1) = manager
            .open(SubscriptionRequest::new("discovery", videos()))
            .await
            .unwrap();
        let (one, _rx2) = manager
            .open(SubscriptionRequest::new(
                "home",
                vec![Filter::new().kind(kind::SHORT_VIDEO).author("alice")],
            ))
            .await
            .unwrap();

        assert_ne!(all.subscription, one.subscription);
        assert_eq!(manager.stats().await.active, 2);
        assert_eq!(relay.req_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let relay = MemoryRelay::new("wss://one.example");
        let manager = manager(&[relay]);

        let (a, _rx_a) = manager.open(SubscriptionRequest::new("a", videos())).await.unwrap();
        let (b, _rx_b) = manager.open(SubscriptionRequest::new("b", videos())).await.unwrap();

        manager.cancel(&a).await;
        manager.cancel(&a).await;
        assert_eq!(manager.listener_count(&b.subscription).await, 1);
        assert_eq!(manager.state(&b.subscription).await, Some(SubscriptionState::Active));
    }

    #[tokio::test]
    async fn test_late_listener_gets_eose() {
        let relay = MemoryRelay::new("wss://one.example");
        let manager = manager(&[relay]);

        let (_a, mut rx_a) = manager.open(SubscriptionRequest::new("a", videos())).await.unwrap();
        assert_eq!(next(&mut rx_a).await, SubscriptionEvent::EndOfStoredEvents);

        let (_b, mut rx_b) = manager.open(SubscriptionRequest::new("b", videos())).await.unwrap();
        assert_eq!(next(&mut rx_b).await, SubscriptionEvent::EndOfStoredEvents);
    }

    #[tokio::test]
    async fn test_eose_waits_for_every_relay() {
        let fast = MemoryRelay::new("wss://fast.example");
        let slow = MemoryRelay::new("wss://slow.example").with_eose_delay(Duration::from_millis(50));
        let manager = manager(&[fast, slow]);

        let (_h, mut rx) = manager.open(SubscriptionRequest::new("a", videos())).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(20), rx.recv()).await.is_err());
        assert_eq!(next(&mut rx).await, SubscriptionEvent::EndOfStoredEvents);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_and_releases_relay() {
        let relay = MemoryRelay::new("wss://silent.example").with_eose_delay(Duration::from_secs(60));
        let manager = manager(&[relay.clone()]);

        let (handle, mut rx) = manager
            .open(SubscriptionRequest::new("slow", videos()).timeout(Duration::from_millis(100)))
            .await
            .unwrap();

        match next(&mut rx).await {
            SubscriptionEvent::Error(SyncError::Timeout { name, timeout }) => {
                assert_eq!(name, "slow");
                assert_eq!(timeout, Duration::from_millis(100));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(manager.state(&handle.subscription).await, Some(SubscriptionState::Errored));
        // The channel closes after the single error.
        assert!(rx.recv().await.is_none());

        tokio::task::yield_now().await;
        assert_eq!(relay.open_subscriptions(), 0);
        manager.cancel(&handle).await;
    }

    #[tokio::test]
    async fn test_shed_lowest_priority_first() {
        let relay = MemoryRelay::new("wss://one.example");
        let config = ManagerConfig {
            max_concurrent: 2,
            ..ManagerConfig::default()
        };
        let manager = manager_with(&[relay], config);

        let (low, mut rx_low) = manager
            .open(SubscriptionRequest::new("low", vec![Filter::new().kind(1)]).priority(Priority::Low))
            .await
            .unwrap();
        let (_normal, _rx_normal) = manager
            .open(SubscriptionRequest::new("normal", vec![Filter::new().kind(2)]))
            .await
            .unwrap();

        let (_high, _rx_high) = manager
            .open(SubscriptionRequest::new("high", vec![Filter::new().kind(3)]).priority(Priority::High))
            .await
            .unwrap();
        assert_eq!(manager.state(&low.subscription).await, Some(SubscriptionState::Cancelled));

        loop {
            match next(&mut rx_low).await {
                SubscriptionEvent::Error(SyncError::Shed(name)) => {
                    assert_eq!(name, "low");
                    break;
                }
                SubscriptionEvent::EndOfStoredEvents => continue,
                other => panic!("unexpected {other:?}"),
            }
        }

        // Nothing ranks below a low-priority request: nothing to shed.
        let err = manager
            .open(SubscriptionRequest::new("another", vec![Filter::new().kind(4)]).priority(Priority::Low))
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::SubscriptionLimit(2));
    }

    #[tokio::test]
    async fn test_invalid_filters_rejected() {
        let manager = manager(&[]);
        assert!(matches!(
            manager.open(SubscriptionRequest::new("none", vec![])).await,
            Err(SyncError::InvalidFilter(_))
        ));
        assert!(matches!(
            manager
                .open(SubscriptionRequest::new("inverted", vec![Filter::new().since(10).until(5)]))
                .await,
            Err(SyncError::InvalidFilter(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_pool_completes_immediately() {
        let manager = manager(&[]);
        let (_h, mut rx) = manager.open(SubscriptionRequest::new("a", videos())).await.unwrap();
        assert_eq!(next(&mut rx).await, SubscriptionEvent::EndOfStoredEvents);
    }

    #[tokio::test]
    async fn test_transport_error_surfaces_to_all_listeners() {
        let relay = MemoryRelay::new("wss://down.example");
        relay.fail_next_subscribe("connection refused");
        let manager = manager(&[relay]);

        let (handle, mut rx) = manager.open(SubscriptionRequest::new("a", videos())).await.unwrap();
        match next(&mut rx).await {
            SubscriptionEvent::Error(SyncError::Transport { relay, .. }) => {
                assert_eq!(relay, RelayUrl::new("wss://down.example"));
            }
            other => panic!("unexpected {other:?}"),
        }
        tokio::task::yield_now().await;
        assert_eq!(manager.state(&handle.subscription).await, Some(SubscriptionState::Errored));
    }

    #[tokio::test]
    async fn test_dropped_receiver_tears_down() {
        let relay = MemoryRelay::new("wss://one.example");
        let manager = manager(&[relay.clone()]);

        let (handle, rx) = manager.open(SubscriptionRequest::new("a", videos())).await.unwrap();
        drop(rx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        relay.publish(video("x", "alice", 5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.state(&handle.subscription).await, Some(SubscriptionState::Completed));
    }

    #[tokio::test]
    async fn test_auth_required_reissued_once() {
        let relay = MemoryRelay::new("wss://private.example").requiring_auth();
        let manager = manager(&[relay.clone()]);
        let url = RelayUrl::new("wss://private.example");

        let (_h, mut rx) = manager.open(SubscriptionRequest::new("a", videos())).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.auth().status(&url), AuthStatus::Challenged);
        assert_eq!(relay.req_count(), 1);

        relay.accept_auth();
        relay.publish(video("secret", "alice", 10));
        manager.auth().on_authenticated(&url).await.unwrap();

        match next(&mut rx).await {
            SubscriptionEvent::Event { event, .. } => assert_eq!(event.id, "secret"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(relay.req_count(), 2);
    }

    #[tokio::test]
    async fn test_revoked_session_surfaces_rejection() {
        let relay = MemoryRelay::new("wss://private.example").requiring_auth();
        relay.accept_auth();
        let manager = manager(&[relay.clone()]);
        let url = RelayUrl::new("wss://private.example");
        manager.auth().on_authenticated(&url).await.unwrap();

        let (_h, mut rx) = manager.open(SubscriptionRequest::new("a", videos())).await.unwrap();
        assert_eq!(next(&mut rx).await, SubscriptionEvent::EndOfStoredEvents);

        relay.revoke_auth();
        assert_eq!(
            next(&mut rx).await,
            SubscriptionEvent::Error(SyncError::AuthRejected(url.clone()))
        );
        assert_eq!(manager.auth().status(&url), AuthStatus::Unauthenticated);
    }

    #[tokio::test]
    async fn test_late_listener_replays_delivered_events() {
        let relay = MemoryRelay::new("wss://one.example")
            .with_events([video("a", "alice", 10), video("b", "bob", 20)]);
        let manager = manager(&[relay.clone()]);

        let (_a, mut rx_a) = manager.open(SubscriptionRequest::new("a", videos())).await.unwrap();
        for _ in 0..2 {
            assert!(matches!(next(&mut rx_a).await, SubscriptionEvent::Event { .. }));
        }
        assert_eq!(next(&mut rx_a).await, SubscriptionEvent::EndOfStoredEvents);

        let (_b, mut rx_b) = manager.open(SubscriptionRequest::new("b", videos())).await.unwrap();
        let mut replayed = Vec::new();
        for _ in 0..2 {
            match next(&mut rx_b).await {
                SubscriptionEvent::Event { event, .. } => replayed.push(event.id),
                other => panic!("unexpected {other:?}"),
            }
        }
        replayed.sort();
        assert_eq!(replayed, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(next(&mut rx_b).await, SubscriptionEvent::EndOfStoredEvents);
        assert_eq!(relay.req_count(), 1);
    }

    #[test]
    fn test_replay_cap_follows_limits() {
        let limited = vec![Filter::new().kind(1).limit(10), Filter::new().kind(2).limit(5)];
        assert_eq!(replay_cap(&limited, 2), 30);
        assert_eq!(replay_cap(&videos(), 1), REPLAY_CAP);
        assert_eq!(replay_cap(&[Filter::new().limit(usize::MAX)], 3), REPLAY_CAP);
    }

    #[tokio::test]
    async fn test_auth_completed_in_flight_reissues_immediately() {
        let url = RelayUrl::new("wss://race.example");
        let auth = Arc::new(AuthTracker::new(Arc::new(MemoryAuthStore::new())));
        let calls = Arc::new(AtomicUsize::new(0));
        let relay = InFlightAuthRelay {
            url: url.clone(),
            auth: Arc::clone(&auth),
            calls: Arc::clone(&calls),
        };
        let pool = RelayPool::with_relays(vec![Arc::new(relay) as Arc<dyn RelayTransport>]);
        let manager = SubscriptionManager::new(pool, Arc::clone(&auth), ManagerConfig::default());

        let (_h, mut rx) = manager.open(SubscriptionRequest::new("a", videos())).await.unwrap();

        match next(&mut rx).await {
            SubscriptionEvent::Event { event, .. } => assert_eq!(event.id, "secret"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(next(&mut rx).await, SubscriptionEvent::EndOfStoredEvents);
        assert_eq!(auth.status(&url), AuthStatus::Authenticated);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_waits_while_relay_challenged() {
        let relay = MemoryRelay::new("wss://private.example").requiring_auth();
        relay.publish(video("secret", "alice", 10));
        let manager = manager(&[relay.clone()]);
        let url = RelayUrl::new("wss://private.example");
        manager
            .auth()
            .on_challenge(&url, Some("challenge-1".to_string()))
            .await
            .unwrap();

        let (_h, mut rx) = manager.open(SubscriptionRequest::new("a", videos())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(relay.req_count(), 0);

        relay.accept_auth();
        manager.auth().on_authenticated(&url).await.unwrap();

        match next(&mut rx).await {
            SubscriptionEvent::Event { event, .. } => assert_eq!(event.id, "secret"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(next(&mut rx).await, SubscriptionEvent::EndOfStoredEvents);
        assert_eq!(relay.req_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_timeout_defers_to_auth_handshake() {
        let relay = MemoryRelay::new("wss://private.example").requiring_auth();
        relay.publish(video("secret", "alice", 10));
        let config = ManagerConfig {
            default_timeout: Duration::from_millis(100),
            auth_timeout: Duration::from_secs(10),
            ..ManagerConfig::default()
        };
        let manager = manager_with(&[relay.clone()], config);
        let url = RelayUrl::new("wss://private.example");
        manager.auth().on_challenge(&url, None).await.unwrap();

        let (handle, mut rx) = manager.open(SubscriptionRequest::new("a", videos())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.state(&handle.subscription).await, Some(SubscriptionState::Active));

        relay.accept_auth();
        manager.auth().on_authenticated(&url).await.unwrap();

        match next(&mut rx).await {
            SubscriptionEvent::Event { event, .. } => assert_eq!(event.id, "secret"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timeout_drops_queued_request() {
        let relay = MemoryRelay::new("wss://private.example").requiring_auth();
        let config = ManagerConfig {
            default_timeout: Duration::from_millis(100),
            auth_timeout: Duration::from_millis(300),
            ..ManagerConfig::default()
        };
        let manager = manager_with(&[relay.clone()], config);
        let url = RelayUrl::new("wss://private.example");
        manager.auth().on_challenge(&url, None).await.unwrap();

        let (handle, mut rx) = manager.open(SubscriptionRequest::new("a", videos())).await.unwrap();

        assert_eq!(
            next(&mut rx).await,
            SubscriptionEvent::Error(SyncError::AuthTimeout(url.clone()))
        );
        assert_eq!(next(&mut rx).await, SubscriptionEvent::EndOfStoredEvents);
        assert!(rx.recv().await.is_none());
        assert_eq!(manager.state(&handle.subscription).await, Some(SubscriptionState::Errored));
        assert_eq!(relay.req_count(), 0);
        assert_eq!(manager.auth().status(&url), AuthStatus::Challenged);
    }
}
