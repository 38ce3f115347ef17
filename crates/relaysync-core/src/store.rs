//! Event store interface and an in-memory implementation.
//!
//! The store is the single source of truth for anything shown in a feed.
//! Events are only ever inserted; the replaceable-event policy is applied when
//! querying, never by rewriting stored rows.

use async_trait::async_trait;
use relaysync_protocol::{latest_replaceable, Event, Filter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::StorageError;
use crate::profile::Profile;

/// Persistent keyed event storage.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Events matching the filter, newest first, capped by `filter.limit`.
    async fn get_by_filter(&self, filter: &Filter) -> Result<Vec<Event>, StorageError>;

    /// Point lookup by event id.
    async fn get_by_id(&self, id: &str) -> Result<Option<Event>, StorageError>;

    /// Insert an event. Inserting an id that already exists is a no-op.
    async fn upsert(&self, event: &Event) -> Result<(), StorageError>;

    /// Latest projected profile of an author.
    async fn get_latest_projection(&self, author: &str) -> Result<Option<Profile>, StorageError>;

    /// Store a projected profile, replacing the author's previous one.
    async fn upsert_projection(&self, profile: &Profile) -> Result<(), StorageError>;
}

/// Store operations that can be made to fail in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// `get_by_filter`
    Query,
    /// `get_by_id`
    Lookup,
    /// `upsert`
    Upsert,
    /// `upsert_projection`
    UpsertProjection,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    events: HashMap<String, Event>,
    profiles: HashMap<String, Profile>,
}

/// In-memory event store.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    inner: RwLock<MemoryStoreInner>,
    upserts: AtomicUsize,
    projection_upserts: AtomicUsize,
    failures: Mutex<HashMap<StoreOp, String>>,
}

impl MemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with events.
    pub async fn with_events(events: impl IntoIterator<Item = Event>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.inner.write().await;
            for ev in events {
                inner.events.entry(ev.id.clone()).or_insert(ev);
            }
        }
        store
    }

    /// Number of stored events.
    pub async fn len(&self) -> usize {
        self.inner.read().await.events.len()
    }

    /// Check if the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.events.is_empty()
    }

    /// Number of event rows actually written.
    #[must_use]
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::Relaxed)
    }

    /// Number of profile rows actually written.
    #[must_use]
    pub fn projection_upsert_count(&self) -> usize {
        self.projection_upserts.load(Ordering::Relaxed)
    }

    /// Make the next call of `op` fail with the given message.
    pub fn fail_next(&self, op: StoreOp, message: &str) {
        self.failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(op, message.to_string());
    }

    fn check(&self, op: StoreOp) -> Result<(), StorageError> {
        let injected = self
            .failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&op);
        match injected {
            Some(message) => Err(StorageError::Backend(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn get_by_filter(&self, filter: &Filter) -> Result<Vec<Event>, StorageError> {
        self.check(StoreOp::Query)?;
        let inner = self.inner.read().await;
        let mut matches: Vec<Event> = inner
            .events
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.feed_order(b));

        let mut result = latest_replaceable(matches);
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        trace!(filter = %filter.canonical_key(), results = result.len(), "Store query");
        Ok(result)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<Event>, StorageError> {
        self.check(StoreOp::Lookup)?;
        Ok(self.inner.read().await.events.get(id).cloned())
    }

    async fn upsert(&self, event: &Event) -> Result<(), StorageError> {
        self.check(StoreOp::Upsert)?;
        let mut inner = self.inner.write().await;
        if !inner.events.contains_key(&event.id) {
            inner.events.insert(event.id.clone(), event.clone());
            self.upserts.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn get_latest_projection(&self, author: &str) -> Result<Option<Profile>, StorageError> {
        Ok(self.inner.read().await.profiles.get(author).cloned())
    }

    async fn upsert_projection(&self, profile: &Profile) -> Result<(), StorageError> {
        self.check(StoreOp::UpsertProjection)?;
        self.inner
            .write()
            .await
            .profiles
            .insert(profile.pubkey.clone(), profile.clone());
        self.projection_upserts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
