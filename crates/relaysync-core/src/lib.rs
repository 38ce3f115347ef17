//! # relaysync-core
//!
//! Local-first relay sync layer.
//!
//! This crate provides the four components between relays and a local
//! event store:
//!
//! - **Subscription** - Shared, ref-counted relay subscriptions with
//!   priority shedding and activity timeouts
//! - **Router** - Idempotent persistence of incoming events plus per-kind
//!   projections
//! - **Auth** - Per-relay authentication state machine, persisted across
//!   restarts
//! - **Feed** - Cache-first feeds that answer from the store and merge live
//!   results without duplicates
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │  RelayPool  │────▶│ Subscription │────▶│    Feed     │
//! └─────────────┘     │   Manager    │     │   Engine    │
//!        ▲            └──────────────┘     └─────────────┘
//!        │                   │                    │
//! ┌─────────────┐            ▼                    ▼
//! │    Auth     │     ┌──────────────┐     ┌─────────────┐
//! │   Tracker   │     │    Event     │────▶│ EventStore  │
//! └─────────────┘     │    Router    │     └─────────────┘
//!                     └──────────────┘
//! ```

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod metrics;
pub mod presets;
pub mod profile;
pub mod router;
pub mod store;
pub mod subscription;
pub mod view;

pub use auth::{
    AuthRecord, AuthStateChange, AuthStateStore, AuthStatus, AuthTracker, JsonFileAuthStore,
    MemoryAuthStore, RelayAuthState,
};
pub use config::{AuthConfig, FeedConfig, SubscriptionConfig, SyncConfig};
pub use engine::{auth_store_for, SyncEngine};
pub use error::{StorageError, SyncError};
pub use feed::{FeedEngine, FeedState, FeedUpdate};
pub use presets::FeedSpec;
pub use profile::Profile;
pub use router::{
    EventRouter, ProfileProjection, Projection, ProjectionStrategy, ProjectionTable, RouteOutcome,
    RouterStats,
};
pub use store::{EventStore, MemoryEventStore, StoreOp};
pub use subscription::{
    ListenerId, ManagerConfig, ManagerStats, Priority, SubscriptionEvent, SubscriptionHandle,
    SubscriptionManager, SubscriptionReceiver, SubscriptionRequest, SubscriptionState,
};
pub use view::FeedView;
