//! Per-relay authentication state.
//!
//! Each relay moves through `Unauthenticated -> Challenged -> Authenticated`.
//! A relay that drops an established session goes back to `Unauthenticated`;
//! one that refuses the handshake, or whose connection fails mid-handshake,
//! ends up `Failed`. A caller giving up on a slow handshake does not change
//! the relay's state.
//!
//! Every transition is broadcast and flushed to an [`AuthStateStore`] so a
//! restart can pick up still-valid sessions.

use async_trait::async_trait;
use dashmap::DashMap;
use relaysync_transport::RelayUrl;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{StorageError, SyncError};
use crate::metrics;

const CHANGE_CAPACITY: usize = 256;

/// Handshake status of one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    /// No session.
    #[default]
    Unauthenticated,
    /// The relay issued a challenge; the handshake is in progress.
    Challenged,
    /// Session established.
    Authenticated,
    /// The relay refused the handshake.
    Failed,
}

impl AuthStatus {
    /// Lowercase label for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuthStatus::Unauthenticated => "unauthenticated",
            AuthStatus::Challenged => "challenged",
            AuthStatus::Authenticated => "authenticated",
            AuthStatus::Failed => "failed",
        }
    }
}

/// Live authentication state of a relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAuthState {
    /// Relay this state belongs to.
    pub relay: RelayUrl,
    /// Current status.
    pub status: AuthStatus,
    /// Unix time of the last successful handshake.
    pub last_authenticated_at: Option<u64>,
    /// Most recent challenge string, if the relay sent one.
    pub challenge: Option<String>,
}

impl RelayAuthState {
    fn new(relay: &RelayUrl) -> Self {
        Self {
            relay: relay.clone(),
            status: AuthStatus::Unauthenticated,
            last_authenticated_at: None,
            challenge: None,
        }
    }

    fn record(&self) -> AuthRecord {
        AuthRecord {
            status: self.status,
            last_authenticated_at: self.last_authenticated_at,
        }
    }
}

/// Persisted form of a relay's auth state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRecord {
    /// Status at the time of the flush.
    pub status: AuthStatus,
    /// Unix time of the last successful handshake.
    #[serde(default)]
    pub last_authenticated_at: Option<u64>,
}

/// A status change, as broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthStateChange {
    /// Relay that changed.
    pub relay: RelayUrl,
    /// Previous status.
    pub from: AuthStatus,
    /// New status.
    pub to: AuthStatus,
}

/// Persistence for auth state, keyed by relay URL.
#[async_trait]
pub trait AuthStateStore: Send + Sync {
    /// Load every persisted record.
    async fn load(&self) -> Result<BTreeMap<String, AuthRecord>, StorageError>;

    /// Persist one relay's record.
    async fn save(&self, relay: &str, record: AuthRecord) -> Result<(), StorageError>;
}

/// Auth store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryAuthStore {
    records: Mutex<BTreeMap<String, AuthRecord>>,
}

impl MemoryAuthStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the given records.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = (String, AuthRecord)>) -> Self {
        Self {
            records: Mutex::new(records.into_iter().collect()),
        }
    }
}

#[async_trait]
impl AuthStateStore for MemoryAuthStore {
    async fn load(&self) -> Result<BTreeMap<String, AuthRecord>, StorageError> {
        Ok(self.records.lock().await.clone())
    }

    async fn save(&self, relay: &str, record: AuthRecord) -> Result<(), StorageError> {
        self.records.lock().await.insert(relay.to_string(), record);
        Ok(())
    }
}

/// Auth store backed by a JSON file.
///
/// Writes go to a sibling temp file which is then renamed over the target,
/// so a crash mid-write leaves the previous contents intact.
#[derive(Debug)]
pub struct JsonFileAuthStore {
    path: PathBuf,
    records: Mutex<Option<BTreeMap<String, AuthRecord>>>,
}

impl JsonFileAuthStore {
    /// Create a store for the given file. The file need not exist yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(None),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<BTreeMap<String, AuthRecord>, StorageError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, records: &BTreeMap<String, AuthRecord>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(records)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl AuthStateStore for JsonFileAuthStore {
    async fn load(&self) -> Result<BTreeMap<String, AuthRecord>, StorageError> {
        let mut cached = self.records.lock().await;
        let records = self.read_file().await?;
        *cached = Some(records.clone());
        Ok(records)
    }

    async fn save(&self, relay: &str, record: AuthRecord) -> Result<(), StorageError> {
        let mut cached = self.records.lock().await;
        if cached.is_none() {
            *cached = Some(self.read_file().await?);
        }
        let records = cached.get_or_insert_with(BTreeMap::new);
        records.insert(relay.to_string(), record);
        self.write_file(records).await
    }
}

/// Tracks the authentication handshake of every relay.
pub struct AuthTracker {
    states: DashMap<RelayUrl, watch::Sender<RelayAuthState>>,
    changes: broadcast::Sender<AuthStateChange>,
    store: Arc<dyn AuthStateStore>,
    flush_lock: Mutex<()>,
}

impl AuthTracker {
    /// Create a tracker with no prior state.
    #[must_use]
    pub fn new(store: Arc<dyn AuthStateStore>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            states: DashMap::new(),
            changes,
            store,
            flush_lock: Mutex::new(()),
        }
    }

    /// Create a tracker from persisted state.
    ///
    /// A relay that was authenticated less than `session_ttl` ago is treated
    /// as still authenticated. Every other record starts over as
    /// unauthenticated, since a half-finished handshake cannot be resumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn restore(
        store: Arc<dyn AuthStateStore>,
        session_ttl: Duration,
    ) -> Result<Self, StorageError> {
        let records = store.load().await?;
        let tracker = Self::new(store);
        let now = unix_now();

        for (url, record) in records {
            let relay = RelayUrl::new(&url);
            let valid = record.status == AuthStatus::Authenticated
                && record
                    .last_authenticated_at
                    .is_some_and(|at| now.saturating_sub(at) < session_ttl.as_secs());
            let state = RelayAuthState {
                status: if valid {
                    AuthStatus::Authenticated
                } else {
                    AuthStatus::Unauthenticated
                },
                last_authenticated_at: record.last_authenticated_at,
                ..RelayAuthState::new(&relay)
            };
            debug!(relay = %relay, status = state.status.as_str(), "Restored auth state");
            tracker.states.insert(relay, watch::channel(state).0);
        }

        info!(relays = tracker.states.len(), "Auth state restored");
        Ok(tracker)
    }

    /// Current state of a relay.
    #[must_use]
    pub fn state(&self, relay: &RelayUrl) -> RelayAuthState {
        self.states
            .get(relay)
            .map(|s| s.borrow().clone())
            .unwrap_or_else(|| RelayAuthState::new(relay))
    }

    /// Current status of a relay.
    #[must_use]
    pub fn status(&self, relay: &RelayUrl) -> AuthStatus {
        self.states
            .get(relay)
            .map(|s| s.borrow().status)
            .unwrap_or_default()
    }

    /// Check if a relay has an established session.
    #[must_use]
    pub fn is_authenticated(&self, relay: &RelayUrl) -> bool {
        self.status(relay) == AuthStatus::Authenticated
    }

    /// Every relay the tracker knows about.
    #[must_use]
    pub fn relays(&self) -> Vec<RelayAuthState> {
        let mut states: Vec<_> = self.states.iter().map(|s| s.borrow().clone()).collect();
        states.sort_by(|a, b| a.relay.cmp(&b.relay));
        states
    }

    /// Receive every status change.
    #[must_use]
    pub fn changes(&self) -> broadcast::Receiver<AuthStateChange> {
        self.changes.subscribe()
    }

    /// Wait until a relay is authenticated.
    ///
    /// Returns immediately if it already is. Giving up after `timeout` does
    /// not change the relay's state.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::AuthTimeout`] if the handshake does not complete
    /// in time, or [`SyncError::AuthRejected`] if the relay refuses it.
    pub async fn await_authentication(
        &self,
        relay: &RelayUrl,
        timeout: Duration,
    ) -> Result<(), SyncError> {
        let mut rx = self
            .states
            .entry(relay.clone())
            .or_insert_with(|| watch::channel(RelayAuthState::new(relay)).0)
            .subscribe();

        let wait = async {
            loop {
                let status = rx.borrow_and_update().status;
                match status {
                    AuthStatus::Authenticated => return Ok(()),
                    AuthStatus::Failed => return Err(SyncError::AuthRejected(relay.clone())),
                    AuthStatus::Unauthenticated | AuthStatus::Challenged => {}
                }
                if rx.changed().await.is_err() {
                    return Err(SyncError::ChannelClosed);
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                debug!(relay = %relay, ?timeout, "Gave up waiting for authentication");
                Err(SyncError::AuthTimeout(relay.clone()))
            }
        }
    }

    /// The relay issued a challenge.
    ///
    /// # Errors
    ///
    /// Returns an error if the new state could not be persisted. The
    /// in-memory transition happens regardless.
    pub async fn on_challenge(
        &self,
        relay: &RelayUrl,
        challenge: Option<String>,
    ) -> Result<(), SyncError> {
        self.transition(relay, |state| {
            if challenge.is_some() {
                state.challenge = challenge;
            }
            state.status = AuthStatus::Challenged;
        })
        .await
    }

    /// The handshake completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the new state could not be persisted.
    pub async fn on_authenticated(&self, relay: &RelayUrl) -> Result<(), SyncError> {
        self.transition(relay, |state| {
            state.status = AuthStatus::Authenticated;
            state.last_authenticated_at = Some(unix_now());
            state.challenge = None;
        })
        .await
    }

    /// The relay rejected us.
    ///
    /// An established session is dropped back to `Unauthenticated`; a
    /// handshake in progress becomes `Failed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the new state could not be persisted.
    pub async fn on_rejected(&self, relay: &RelayUrl) -> Result<(), SyncError> {
        self.transition(relay, |state| {
            state.status = match state.status {
                AuthStatus::Authenticated => AuthStatus::Unauthenticated,
                AuthStatus::Challenged => AuthStatus::Failed,
                other => other,
            };
        })
        .await
    }

    /// The connection failed during a handshake.
    ///
    /// Only a relay that is currently `Challenged` is affected.
    ///
    /// # Errors
    ///
    /// Returns an error if the new state could not be persisted.
    pub async fn on_failure(&self, relay: &RelayUrl) -> Result<(), SyncError> {
        self.transition(relay, |state| {
            if state.status == AuthStatus::Challenged {
                state.status = AuthStatus::Failed;
            }
        })
        .await
    }

    /// Forget a relay's session entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if the new state could not be persisted.
    pub async fn reset(&self, relay: &RelayUrl) -> Result<(), SyncError> {
        self.transition(relay, |state| {
            state.status = AuthStatus::Unauthenticated;
            state.challenge = None;
        })
        .await
    }

    async fn transition(
        &self,
        relay: &RelayUrl,
        apply: impl FnOnce(&mut RelayAuthState),
    ) -> Result<(), SyncError> {
        let mut change = None;
        self.states
            .entry(relay.clone())
            .or_insert_with(|| watch::channel(RelayAuthState::new(relay)).0)
            .send_if_modified(|state| {
                let from = state.status;
                apply(state);
                if state.status == from {
                    return false;
                }
                change = Some(AuthStateChange {
                    relay: relay.clone(),
                    from,
                    to: state.status,
                });
                true
            });

        let Some(change) = change else {
            return Ok(());
        };

        info!(
            relay = %relay,
            from = change.from.as_str(),
            to = change.to.as_str(),
            "Auth state changed"
        );
        metrics::record_auth_transition(change.to.as_str());
        let _ = self.changes.send(change);
        self.flush(relay).await
    }

    async fn flush(&self, relay: &RelayUrl) -> Result<(), SyncError> {
        let _guard = self.flush_lock.lock().await;
        let record = self.state(relay).record();
        if let Err(e) = self.store.save(relay.as_str(), record).await {
            warn!(relay = %relay, error = %e, "Failed to persist auth state");
            metrics::record_error("storage");
            return Err(e.into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for AuthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthTracker")
            .field("relays", &self.relays())
            .finish()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
