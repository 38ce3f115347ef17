//! Event router.
//!
//! Every event coming off a relay passes through the router before any feed
//! sees it. The router persists the raw event, applies the kind-specific
//! projection (if any), and only then announces the event. Anything a feed
//! shows is therefore already durable.

use async_trait::async_trait;
use dashmap::DashMap;
use relaysync_protocol::{kind, Event, EventId, Kind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{StorageError, SyncError};
use crate::metrics;
use crate::profile::Profile;
use crate::store::EventStore;

/// Capacity of the router-wide broadcast channel.
const BROADCAST_CAPACITY: usize = 1024;

/// Result of routing one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The event was new and is now stored.
    Stored,
    /// The event was already stored; nothing was done.
    Duplicate,
}

impl RouteOutcome {
    /// Check whether this call wrote the event. Either way it is durable.
    #[must_use]
    pub fn is_stored(self) -> bool {
        matches!(self, RouteOutcome::Stored)
    }
}

/// A materialised view derived from events of particular kinds.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Apply the event to the view.
    ///
    /// Returns `true` if the view changed.
    async fn project(&self, event: &Event, store: &dyn EventStore) -> Result<bool, StorageError>;
}

/// What the router does with a given kind.
#[derive(Clone)]
pub enum ProjectionStrategy {
    /// Persist the raw event only.
    StoreOnly,
    /// Persist, then project.
    Project(Arc<dyn Projection>),
}

impl std::fmt::Debug for ProjectionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectionStrategy::StoreOnly => f.write_str("StoreOnly"),
            ProjectionStrategy::Project(p) => write!(f, "Project({})", p.name()),
        }
    }
}

/// Kind to projection lookup.
///
/// Kinds without an entry are store-only, so new kinds never need router
/// changes.
#[derive(Clone, Default)]
pub struct ProjectionTable {
    strategies: HashMap<Kind, Arc<dyn Projection>>,
}

impl ProjectionTable {
    /// Create an empty table: every kind is store-only.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the standard table (profile metadata projection).
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register(kind::PROFILE, Arc::new(ProfileProjection));
        table
    }

    /// Register a projection for a kind, replacing any previous one.
    pub fn register(&mut self, kind: Kind, projection: Arc<dyn Projection>) {
        self.strategies.insert(kind, projection);
    }

    /// Look up the strategy for a kind.
    #[must_use]
    pub fn strategy(&self, kind: Kind) -> ProjectionStrategy {
        match self.strategies.get(&kind) {
            Some(p) => ProjectionStrategy::Project(Arc::clone(p)),
            None => ProjectionStrategy::StoreOnly,
        }
    }

    /// Kinds with a registered projection.
    #[must_use]
    pub fn kinds(&self) -> Vec<Kind> {
        let mut kinds: Vec<_> = self.strategies.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for ProjectionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionTable")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// Latest profile per author.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileProjection;

#[async_trait]
impl Projection for ProfileProjection {
    fn name(&self) -> &'static str {
        "profile"
    }

    async fn project(&self, event: &Event, store: &dyn EventStore) -> Result<bool, StorageError> {
        let profile = match Profile::from_event(event) {
            Ok(p) => p,
            Err(e) => {
                debug!(event = %event.id, error = %e, "Malformed profile content, storing only");
                return Ok(false);
            }
        };

        if let Some(existing) = store.get_latest_projection(&event.pubkey).await? {
            if !profile.supersedes(&existing) {
                trace!(author = %event.pubkey, "Stale profile ignored");
                return Ok(false);
            }
        }

        store.upsert_projection(&profile).await?;
        Ok(true)
    }
}

/// Persists and projects incoming events.
pub struct EventRouter {
    store: Arc<dyn EventStore>,
    projections: ProjectionTable,
    /// Single-writer lock per event id.
    locks: DashMap<EventId, Arc<Mutex<()>>>,
    sender: broadcast::Sender<Arc<Event>>,
    stored: AtomicU64,
    duplicates: AtomicU64,
    projected: AtomicU64,
}

impl EventRouter {
    /// Create a router with the standard projection table.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self::with_projections(store, ProjectionTable::with_defaults())
    }

    /// Create a router with a custom projection table.
    #[must_use]
    pub fn with_projections(store: Arc<dyn EventStore>, projections: ProjectionTable) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            store,
            projections,
            locks: DashMap::new(),
            sender,
            stored: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            projected: AtomicU64::new(0),
        }
    }

    /// The store events are persisted to.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Receive every newly stored event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.sender.subscribe()
    }

    /// Route one event: persist it, project it, announce it.
    ///
    /// Idempotent: an event already in the store is not reprocessed.
    /// Concurrent calls for the same id are serialised, and the loser only
    /// sees `Duplicate` once the winner's write is durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookup or write fails. Projection
    /// failures are logged and do not fail the call, since the raw event is
    /// already durable.
    pub async fn handle_event(&self, event: &Event) -> Result<RouteOutcome, SyncError> {
        let lock = Arc::clone(self.locks.entry(event.id.clone()).or_default().value());
        let outcome = {
            let _guard = lock.lock().await;
            self.route_locked(event).await
        };
        drop(lock);
        self.locks
            .remove_if(&event.id, |_, l| Arc::strong_count(l) == 1);
        outcome
    }

    async fn route_locked(&self, event: &Event) -> Result<RouteOutcome, SyncError> {
        if self.store.get_by_id(&event.id).await?.is_some() {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            metrics::record_duplicate();
            trace!(event = %event.id, "Duplicate event absorbed");
            return Ok(RouteOutcome::Duplicate);
        }

        self.store.upsert(event).await?;
        self.stored.fetch_add(1, Ordering::Relaxed);
        metrics::record_routed(event.kind);

        if let ProjectionStrategy::Project(projection) = self.projections.strategy(event.kind) {
            match projection.project(event, self.store.as_ref()).await {
                Ok(true) => {
                    self.projected.fetch_add(1, Ordering::Relaxed);
                    metrics::record_projection(projection.name());
                    debug!(event = %event.id, projection = projection.name(), "Projection updated");
                }
                Ok(false) => {}
                Err(e) => {
                    metrics::record_error("projection");
                    warn!(
                        event = %event.id,
                        projection = projection.name(),
                        error = %e,
                        "Projection failed"
                    );
                }
            }
        }

        trace!(event = %event.id, kind = event.kind, "Event stored");
        let _ = self.sender.send(Arc::new(event.clone()));
        Ok(RouteOutcome::Stored)
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            stored: self.stored.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            projected: self.projected.load(Ordering::Relaxed),
            in_flight: self.locks.len(),
        }
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("projections", &self.projections)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Router statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    /// Events newly stored.
    pub stored: u64,
    /// Events absorbed as duplicates.
    pub duplicates: u64,
    /// Projection rows written.
    pub projected: u64,
    /// Event ids currently being routed.
    pub in_flight: usize,
}
