//! Cache-first feed engine.
//!
//! A feed is a named, filtered view. Subscribing answers from the local
//! store immediately while a live relay query runs in the background; live
//! events are persisted by the router and then merged into the view without
//! duplicates. Older pages are pulled in with [`FeedEngine::load_more`].
//!
//! ```text
//!                  ┌──────────────┐  snapshot   ┌──────────┐
//!  subscribe ─────▶│  EventStore  │────────────▶│          │
//!       │          └──────────────┘             │ FeedView │──▶ watchers
//!       │          ┌──────────────┐   route     │          │
//!       └─────────▶│ Subscription │──▶ Router ─▶│          │
//!                  └──────────────┘             └──────────┘
//! ```

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use relaysync_protocol::{any_match, Event, Filter, FilterSetKey};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::FeedConfig;
use crate::error::SyncError;
use crate::metrics;
use crate::presets::FeedSpec;
use crate::router::EventRouter;
use crate::store::EventStore;
use crate::subscription::{
    SubscriptionEvent, SubscriptionHandle, SubscriptionManager, SubscriptionReceiver,
    SubscriptionRequest,
};
use crate::view::FeedView;

const UPDATE_CAPACITY: usize = 256;

/// Lifecycle of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedState {
    /// Not subscribed.
    Idle,
    /// Initial cache query in progress.
    Loading,
    /// Cached results available; live results merging.
    Populated,
}

/// A change to a feed, carrying the view length after the change.
///
/// Lengths seen by one watcher never decrease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedUpdate {
    /// Initial cache snapshot applied.
    Snapshot {
        /// View length.
        len: usize,
    },
    /// A live event was merged.
    Merged {
        /// View length.
        len: usize,
    },
    /// A page of older events was merged.
    Paged {
        /// View length.
        len: usize,
        /// Events the page added.
        added: usize,
        /// Whether older events may still exist.
        has_more: bool,
    },
    /// Every relay finished replaying stored events.
    LiveSynced {
        /// View length.
        len: usize,
    },
    /// The live half failed. Cached data is unaffected.
    LiveError {
        /// View length.
        len: usize,
        /// What went wrong.
        error: SyncError,
    },
}

impl FeedUpdate {
    /// View length after the update.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            FeedUpdate::Snapshot { len }
            | FeedUpdate::Merged { len }
            | FeedUpdate::Paged { len, .. }
            | FeedUpdate::LiveSynced { len }
            | FeedUpdate::LiveError { len, .. } => *len,
        }
    }

    /// Check if the view was empty after the update.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct LiveHalf {
    handle: Option<SubscriptionHandle>,
    drain: Option<JoinHandle<()>>,
    closed: bool,
}

struct FeedSlot {
    name: String,
    filters: Vec<Filter>,
    key: FilterSetKey,
    limit: usize,
    view: RwLock<FeedView>,
    state: watch::Sender<FeedState>,
    updates: broadcast::Sender<FeedUpdate>,
    live_error: Mutex<Option<SyncError>>,
    live: Mutex<LiveHalf>,
    /// Serialises `load_more` calls.
    paging: tokio::sync::Mutex<()>,
}

impl FeedSlot {
    fn new(name: &str, filters: Vec<Filter>, key: FilterSetKey, limit: usize) -> Self {
        Self {
            name: name.to_string(),
            filters,
            key,
            limit,
            view: RwLock::new(FeedView::new()),
            state: watch::channel(FeedState::Loading).0,
            updates: broadcast::channel(UPDATE_CAPACITY).0,
            live_error: Mutex::new(None),
            live: Mutex::new(LiveHalf::default()),
            paging: tokio::sync::Mutex::new(()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, FeedView> {
        self.view.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> MutexGuard<'_, LiveHalf> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge events and notify watchers while still holding the view, so
    /// updates go out in length order.
    fn merge(
        &self,
        events: impl IntoIterator<Item = Arc<Event>>,
        update: impl FnOnce(&mut FeedView, usize) -> Option<FeedUpdate>,
    ) -> usize {
        let mut view = self.view.write().unwrap_or_else(PoisonError::into_inner);
        let added = view.extend(events);
        if let Some(update) = update(&mut view, added) {
            let _ = self.updates.send(update);
        }
        added
    }

    fn notify(&self, update: impl FnOnce(&FeedView) -> FeedUpdate) {
        let view = self.view.write().unwrap_or_else(PoisonError::into_inner);
        let _ = self.updates.send(update(&view));
    }

    fn record_live_error(&self, error: SyncError) {
        warn!(feed = %self.name, error = %error, "Live feed error");
        *self.live_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.clone());
        self.notify(|view| FeedUpdate::LiveError {
            len: view.len(),
            error,
        });
    }

    async fn wait_populated(&self) -> Result<(), SyncError> {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                FeedState::Populated => return Ok(()),
                FeedState::Idle => return Err(SyncError::FeedNotFound(self.name.clone())),
                FeedState::Loading => {}
            }
            if rx.changed().await.is_err() {
                return Err(SyncError::ChannelClosed);
            }
        }
    }
}

struct FeedInner {
    store: Arc<dyn EventStore>,
    router: Arc<EventRouter>,
    manager: SubscriptionManager,
    config: FeedConfig,
    feeds: DashMap<String, Arc<FeedSlot>>,
}

/// Maintains every subscribed feed.
///
/// Cheap to clone; clones share the same feeds.
#[derive(Clone)]
pub struct FeedEngine {
    inner: Arc<FeedInner>,
}

impl FeedEngine {
    /// Create a feed engine.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        router: Arc<EventRouter>,
        manager: SubscriptionManager,
        config: FeedConfig,
    ) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                store,
                router,
                manager,
                config,
                feeds: DashMap::new(),
            }),
        }
    }

    /// Subscribe a preset feed.
    ///
    /// # Errors
    ///
    /// See [`FeedEngine::subscribe_feed`].
    pub async fn subscribe(&self, spec: &FeedSpec) -> Result<(), SyncError> {
        self.subscribe_feed(&spec.name, spec.filters.clone(), spec.limit)
            .await
    }

    /// Subscribe a feed.
    ///
    /// Returns once the cached snapshot is in the view; the live query keeps
    /// merging in the background. `limit` caps the snapshot and sets the
    /// default page size (`0` uses the configured default).
    ///
    /// Subscribing a name that already exists with the same filters waits
    /// for its first population and returns.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidFilter`] for an unusable filter set and
    /// [`SyncError::FeedConflict`] if the name is taken by different filters.
    /// Live query failures are not errors here; see
    /// [`FeedEngine::live_error`].
    pub async fn subscribe_feed(
        &self,
        name: &str,
        filters: Vec<Filter>,
        limit: usize,
    ) -> Result<(), SyncError> {
        if filters.is_empty() {
            return Err(SyncError::InvalidFilter("empty filter set".to_string()));
        }
        for filter in &filters {
            filter.validate()?;
        }
        let limit = if limit == 0 {
            self.inner.config.default_limit
        } else {
            limit
        };

        let key = FilterSetKey::new(&filters);
        let fresh = Arc::new(FeedSlot::new(name, filters, key, limit));
        let existing = match self.inner.feeds.entry(name.to_string()) {
            MapEntry::Occupied(occupied) => Some(Arc::clone(occupied.get())),
            MapEntry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&fresh));
                None
            }
        };

        if let Some(existing) = existing {
            if existing.key != fresh.key {
                return Err(SyncError::FeedConflict(name.to_string()));
            }
            debug!(feed = %name, "Feed already subscribed, waiting for population");
            return existing.wait_populated().await;
        }

        let slot = fresh;
        metrics::set_active_feeds(self.inner.feeds.len());
        info!(feed = %name, key = %slot.key, limit, "Subscribing feed");

        let limited = with_limit(&slot.filters, limit);
        let request = SubscriptionRequest::new(name, limited.clone())
            .timeout(self.inner.config.live_timeout());
        let (cached, opened) = tokio::join!(
            self.inner.query_cache(&limited),
            self.inner.manager.open(request),
        );

        let cached_len = slot.merge(cached, |view, _| Some(FeedUpdate::Snapshot { len: view.len() }));
        debug!(feed = %name, cached = cached_len, "Cache snapshot applied");

        match opened {
            Ok((handle, rx)) => {
                let stale = {
                    let mut live = slot.live();
                    if live.closed {
                        Some(handle)
                    } else {
                        live.drain = Some(tokio::spawn(drain_live(
                            Arc::clone(&slot),
                            Arc::clone(&self.inner.router),
                            rx,
                        )));
                        live.handle = Some(handle);
                        None
                    }
                };
                if let Some(handle) = stale {
                    debug!(feed = %name, "Feed unsubscribed while loading");
                    self.inner.manager.cancel(&handle).await;
                    return Ok(());
                }
            }
            Err(e) => slot.record_live_error(e),
        }

        slot.state.send_if_modified(|state| {
            if *state == FeedState::Loading {
                *state = FeedState::Populated;
                return true;
            }
            false
        });
        Ok(())
    }

    /// Current events of a feed, newest first. Empty for unknown feeds.
    #[must_use]
    pub fn videos(&self, name: &str) -> Vec<Arc<Event>> {
        self.inner
            .feeds
            .get(name)
            .map(|slot| slot.read().events())
            .unwrap_or_default()
    }

    /// Page in events older than the feed's cursor.
    ///
    /// Queries the store and the relays with `until = cursor - 1`. When the
    /// page yields fewer than `limit` events the feed is marked as having no
    /// more. Returns how many events were added. Calls on one feed run one
    /// at a time.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::FeedNotFound`] for unknown feeds.
    pub async fn load_more(&self, name: &str, limit: usize) -> Result<usize, SyncError> {
        let slot = self.slot(name)?;
        slot.wait_populated().await?;
        let _paging = slot.paging.lock().await;

        if !slot.read().has_more() {
            trace!(feed = %name, "No more pages");
            return Ok(0);
        }
        let limit = if limit == 0 { slot.limit } else { limit };
        let cursor = slot.read().cursor();

        let page_filters: Vec<Filter> = match cursor {
            Some(cursor) => slot
                .filters
                .iter()
                .filter_map(|f| f.older_than(cursor))
                .map(|f| f.limit(limit))
                .collect(),
            None => with_limit(&slot.filters, limit),
        };

        let results = if page_filters.is_empty() {
            Vec::new()
        } else {
            let (cached, fetched) = tokio::join!(
                self.inner.query_cache(&page_filters),
                self.inner.fetch_page(&slot.name, &page_filters),
            );
            let mut seen = HashSet::new();
            cached
                .into_iter()
                .chain(fetched)
                .filter(|e| seen.insert(e.id.clone()))
                .collect::<Vec<_>>()
        };

        let exhausted = results.len() < limit;
        let added = slot.merge(results, |view, added| {
            if exhausted {
                view.set_has_more(false);
            }
            Some(FeedUpdate::Paged {
                len: view.len(),
                added,
                has_more: view.has_more(),
            })
        });
        debug!(feed = %name, ?cursor, added, exhausted, "Loaded page");
        Ok(added)
    }

    /// Clear a "no more pages" verdict without touching the events.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::FeedNotFound`] for unknown feeds.
    pub fn reset_pagination(&self, name: &str) -> Result<(), SyncError> {
        let slot = self.slot(name)?;
        slot.view
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_has_more(true);
        debug!(feed = %name, "Pagination reset");
        Ok(())
    }

    /// Drop a feed and release its live subscription.
    ///
    /// Returns `false` if the feed was not subscribed. Calling it twice
    /// releases the subscription once.
    pub async fn unsubscribe_feed(&self, name: &str) -> bool {
        let Some((_, slot)) = self.inner.feeds.remove(name) else {
            return false;
        };
        let handle = {
            let mut live = slot.live();
            live.closed = true;
            if let Some(drain) = live.drain.take() {
                drain.abort();
            }
            live.handle.take()
        };
        slot.state.send_replace(FeedState::Idle);
        if let Some(handle) = handle {
            self.inner.manager.cancel(&handle).await;
        }
        metrics::set_active_feeds(self.inner.feeds.len());
        info!(feed = %name, "Unsubscribed feed");
        true
    }

    /// Watch a feed's updates.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::FeedNotFound`] for unknown feeds.
    pub fn watch_feed(&self, name: &str) -> Result<broadcast::Receiver<FeedUpdate>, SyncError> {
        Ok(self.slot(name)?.updates.subscribe())
    }

    /// Lifecycle state of a feed. `Idle` for unknown feeds.
    #[must_use]
    pub fn state(&self, name: &str) -> FeedState {
        self.inner
            .feeds
            .get(name)
            .map_or(FeedState::Idle, |slot| *slot.state.borrow())
    }

    /// Whether older events may still exist.
    #[must_use]
    pub fn has_more(&self, name: &str) -> Option<bool> {
        self.inner.feeds.get(name).map(|slot| slot.read().has_more())
    }

    /// `created_at` of a feed's oldest event.
    #[must_use]
    pub fn cursor(&self, name: &str) -> Option<u64> {
        self.inner.feeds.get(name).and_then(|slot| slot.read().cursor())
    }

    /// Last error of a feed's live half, if any.
    #[must_use]
    pub fn live_error(&self, name: &str) -> Option<SyncError> {
        self.inner.feeds.get(name).and_then(|slot| {
            slot.live_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// Names of subscribed feeds.
    #[must_use]
    pub fn feed_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.feeds.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn slot(&self, name: &str) -> Result<Arc<FeedSlot>, SyncError> {
        self.inner
            .feeds
            .get(name)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| SyncError::FeedNotFound(name.to_string()))
    }
}

impl std::fmt::Debug for FeedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedEngine")
            .field("feeds", &self.feed_names())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl FeedInner {
    /// Cache half of a query. Store failures degrade to an empty result.
    async fn query_cache(&self, filters: &[Filter]) -> Vec<Arc<Event>> {
        let mut events = Vec::new();
        for filter in filters {
            match self.store.get_by_filter(filter).await {
                Ok(found) => events.extend(found.into_iter().map(Arc::new)),
                Err(e) => {
                    warn!(filter = %filter.canonical_key(), error = %e, "Cache query failed");
                    metrics::record_error("storage");
                }
            }
        }
        events
    }

    /// Relay half of a page: a one-shot subscription drained until every
    /// relay has sent its stored events or the page timeout elapses.
    async fn fetch_page(&self, feed: &str, filters: &[Filter]) -> Vec<Arc<Event>> {
        let timeout = self.config.page_timeout();
        let request = SubscriptionRequest::new(format!("{feed}:page"), filters.to_vec())
            .timeout(timeout);
        let (handle, mut rx) = match self.manager.open(request).await {
            Ok(opened) => opened,
            Err(e) => {
                debug!(feed = %feed, error = %e, "Page served from cache only");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        let collect = async {
            while let Some(message) = rx.recv().await {
                match message {
                    SubscriptionEvent::Event { event, .. } => {
                        if !any_match(filters, &event) {
                            continue;
                        }
                        match self.router.handle_event(&event).await {
                            Ok(_) => events.push(Arc::new(event)),
                            Err(e) => warn!(feed = %feed, error = %e, "Failed to route page event"),
                        }
                    }
                    SubscriptionEvent::EndOfStoredEvents => break,
                    SubscriptionEvent::Error(e) => {
                        debug!(feed = %feed, error = %e, "Page fetch relay error");
                    }
                }
            }
        };
        if tokio::time::timeout(timeout, collect).await.is_err() {
            debug!(feed = %feed, ?timeout, "Page fetch timed out");
        }

        self.manager.cancel(&handle).await;
        events
    }
}

/// Merge a feed's live subscription into its view until the subscription
/// ends or the feed is dropped.
async fn drain_live(slot: Arc<FeedSlot>, router: Arc<EventRouter>, mut rx: SubscriptionReceiver) {
    while let Some(message) = rx.recv().await {
        match message {
            SubscriptionEvent::Event { relay, event } => {
                if !any_match(&slot.filters, &event) {
                    trace!(feed = %slot.name, relay = %relay, event = %event.id, "Dropped non-matching event");
                    continue;
                }
                if slot.read().contains(&event.id) {
                    continue;
                }
                match router.handle_event(&event).await {
                    Ok(_) => {
                        slot.merge([Arc::new(event)], |view, added| {
                            (added > 0).then(|| FeedUpdate::Merged { len: view.len() })
                        });
                    }
                    Err(e) => slot.record_live_error(e),
                }
            }
            SubscriptionEvent::EndOfStoredEvents => {
                debug!(feed = %slot.name, "Live feed caught up");
                slot.notify(|view| FeedUpdate::LiveSynced { len: view.len() });
            }
            SubscriptionEvent::Error(e) => slot.record_live_error(e),
        }
    }
    debug!(feed = %slot.name, "Live subscription ended");
}

fn with_limit(filters: &[Filter], limit: usize) -> Vec<Filter> {
    filters.iter().map(|f| f.clone().limit(limit)).collect()
}
