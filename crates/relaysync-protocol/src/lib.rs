//! # relaysync-protocol
//!
//! Data model and wire format for talking to event relays.
//!
//! ## Contents
//!
//! - `Event` / `Tag` - Immutable, content-addressed records
//! - `Filter` - Predicates over events, with canonical keys for reuse
//! - `ClientMessage` / `RelayMessage` - JSON array frames
//! - `codec` - Text encoding with size limits
//!
//! ## Example
//!
//! ```rust
//! use relaysync_protocol::{codec, ClientMessage, Filter};
//!
//! let req = ClientMessage::req("feed-1", vec![Filter::new().kind(22).limit(20)]);
//! let encoded = codec::encode_client(&req).unwrap();
//! let decoded: ClientMessage = codec::decode(&encoded).unwrap();
//! assert_eq!(req, decoded);
//! ```

pub mod codec;
pub mod event;
pub mod filter;
pub mod frames;

pub use codec::{decode, decode_relay, encode, encode_client, ProtocolError};
pub use event::{kind, latest_replaceable, AuthorId, Event, EventId, Kind, Tag};
pub use filter::{any_match, Filter, FilterError, FilterKey, FilterSetKey};
pub use frames::{ClientMessage, ClosedPrefix, ClosedReason, RelayMessage};
