//! Wiring of the four sync components.

use relaysync_transport::{RelayPool, RelayTransport, RelayUrl};
use std::sync::Arc;
use tracing::info;

use crate::auth::{AuthStateStore, AuthTracker, JsonFileAuthStore, MemoryAuthStore};
use crate::config::{AuthConfig, SyncConfig};
use crate::error::SyncError;
use crate::feed::FeedEngine;
use crate::router::EventRouter;
use crate::store::EventStore;
use crate::subscription::{ManagerConfig, SubscriptionManager};

/// The assembled sync layer.
///
/// ```rust,ignore
/// let engine = SyncEngine::new(config, store, pool, auth_store).await?;
/// engine.feeds().subscribe(&FeedSpec::discovery(20)).await?;
/// let videos = engine.feeds().videos("discovery");
/// ```
#[derive(Clone)]
pub struct SyncEngine {
    config: SyncConfig,
    auth: Arc<AuthTracker>,
    router: Arc<EventRouter>,
    subscriptions: SubscriptionManager,
    feeds: FeedEngine,
}

impl SyncEngine {
    /// Restore auth state and build the router, subscription manager and
    /// feed engine on top of `store` and `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if persisted auth state cannot be read.
    pub async fn new(
        config: SyncConfig,
        store: Arc<dyn EventStore>,
        pool: RelayPool,
        auth_store: Arc<dyn AuthStateStore>,
    ) -> Result<Self, SyncError> {
        let auth = Arc::new(AuthTracker::restore(auth_store, config.auth.session_ttl()).await?);
        let router = Arc::new(EventRouter::new(Arc::clone(&store)));
        let subscriptions = SubscriptionManager::new(
            pool,
            Arc::clone(&auth),
            ManagerConfig::from_config(&config.subscriptions, &config.auth),
        );
        let feeds = FeedEngine::new(
            store,
            Arc::clone(&router),
            subscriptions.clone(),
            config.feeds.clone(),
        );

        info!(
            relays = subscriptions.pool().len(),
            max_subscriptions = config.subscriptions.max_concurrent,
            "Sync engine ready"
        );

        Ok(Self {
            config,
            auth,
            router,
            subscriptions,
            feeds,
        })
    }

    /// Like [`SyncEngine::new`], with the pool built from `config.relays`.
    /// `connect` opens the transport for each distinct relay.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Storage`] if persisted auth state cannot be read.
    pub async fn connect<F>(
        config: SyncConfig,
        store: Arc<dyn EventStore>,
        auth_store: Arc<dyn AuthStateStore>,
        connect: F,
    ) -> Result<Self, SyncError>
    where
        F: FnMut(RelayUrl) -> Arc<dyn RelayTransport>,
    {
        let pool = RelayPool::from_urls(&config.relays, connect);
        Self::new(config, store, pool, auth_store).await
    }

    /// Configuration the engine was built with.
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Authentication state tracker.
    #[must_use]
    pub fn auth(&self) -> &Arc<AuthTracker> {
        &self.auth
    }

    /// Event router.
    #[must_use]
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// Subscription manager.
    #[must_use]
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Feed engine.
    #[must_use]
    pub fn feeds(&self) -> &FeedEngine {
        &self.feeds
    }

    /// Unsubscribe every feed.
    pub async fn shutdown(&self) {
        for name in self.feeds.feed_names() {
            self.feeds.unsubscribe_feed(&name).await;
        }
        info!("Sync engine stopped");
    }
}

/// Auth persistence for a config section: a JSON file when `state_path` is
/// set, otherwise in memory.
#[must_use]
pub fn auth_store_for(config: &AuthConfig) -> Arc<dyn AuthStateStore> {
    match &config.state_path {
        Some(path) => Arc::new(JsonFileAuthStore::new(path.clone())),
        None => Arc::new(MemoryAuthStore::new()),
    }
}
