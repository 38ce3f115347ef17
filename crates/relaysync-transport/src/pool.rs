//! Relay pool.
//!
//! Holds the set of relays a client talks to, in the order they were added.

use crate::traits::{RelayTransport, RelayUrl};
use std::sync::Arc;
use tracing::debug;

/// The relays a client reads from.
#[derive(Clone, Default)]
pub struct RelayPool {
    relays: Vec<Arc<dyn RelayTransport>>,
}

impl RelayPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool from the given relays.
    ///
    /// Later entries with a URL already present replace the earlier one.
    #[must_use]
    pub fn with_relays(relays: Vec<Arc<dyn RelayTransport>>) -> Self {
        let mut pool = Self::new();
        for relay in relays {
            pool.add(relay);
        }
        pool
    }

    /// Create a pool by connecting to each URL once. URLs are normalized
    /// first, so spelling variants of one relay share a transport.
    pub fn from_urls<I, S, F>(urls: I, mut connect: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnMut(RelayUrl) -> Arc<dyn RelayTransport>,
    {
        let mut pool = Self::new();
        for url in urls {
            let url = RelayUrl::new(url);
            if pool.get(&url).is_none() {
                pool.add(connect(url));
            }
        }
        pool
    }

    /// Add a relay, replacing any relay with the same URL.
    pub fn add(&mut self, relay: Arc<dyn RelayTransport>) {
        let url = relay.url().clone();
        if let Some(slot) = self.relays.iter_mut().find(|r| *r.url() == url) {
            debug!(relay = %url, "Replacing relay in pool");
            *slot = relay;
        } else {
            debug!(relay = %url, "Adding relay to pool");
            self.relays.push(relay);
        }
    }

    /// Remove a relay. Returns `true` if it was present.
    pub fn remove(&mut self, url: &RelayUrl) -> bool {
        let before = self.relays.len();
        self.relays.retain(|r| r.url() != url);
        before != self.relays.len()
    }

    /// Look up a relay by URL.
    #[must_use]
    pub fn get(&self, url: &RelayUrl) -> Option<Arc<dyn RelayTransport>> {
        self.relays.iter().find(|r| r.url() == url).cloned()
    }

    /// All relays in insertion order.
    #[must_use]
    pub fn relays(&self) -> &[Arc<dyn RelayTransport>] {
        &self.relays
    }

    /// Relays currently reporting healthy.
    #[must_use]
    pub fn healthy(&self) -> Vec<Arc<dyn RelayTransport>> {
        self.relays
            .iter()
            .filter(|r| r.is_healthy())
            .cloned()
            .collect()
    }

    /// URLs of all relays in insertion order.
    #[must_use]
    pub fn urls(&self) -> Vec<RelayUrl> {
        self.relays.iter().map(|r| r.url().clone()).collect()
    }

    /// Number of relays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.relays.len()
    }

    /// Check if the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Check if at least one relay is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.relays.iter().any(|r| r.is_healthy())
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("relays", &self.urls())
            .finish()
    }
}
