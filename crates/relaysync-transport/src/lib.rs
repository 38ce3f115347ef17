//! # relaysync-transport
//!
//! Relay transport abstraction for relaysync.
//!
//! - **RelayTransport** - One connection to one relay: filter sets in,
//!   notification streams out
//! - **RelayPool** - The relays a client reads from
//! - **MemoryRelay** - In-process relay speaking the real wire codec
//!
//! ```rust,ignore
//! use relaysync_transport::{RelayTransport, RelayNotification};
//!
//! let mut stream = relay.subscribe(&"feed-1".into(), filters).await?;
//! while let Some(notification) = stream.next().await {
//!     match notification {
//!         RelayNotification::Event(event) => { /* stored or live */ }
//!         RelayNotification::EndOfStoredEvents => { /* history done */ }
//!         _ => {}
//!     }
//! }
//! ```

pub mod memory;
pub mod pool;
pub mod traits;

pub use memory::MemoryRelay;
pub use pool::RelayPool;
pub use traits::{
    RelayNotification, RelayStream, RelayTransport, RelayUrl, SubscriptionId, TransportError,
};
