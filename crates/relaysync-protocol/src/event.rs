//! Event model for the relay protocol.
//!
//! Events are immutable, content-addressed records. Two events with the same
//! `id` are the same event no matter which relay (or the local cache) they
//! came from.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

/// An event identifier (hex-encoded content hash).
pub type EventId = String;

/// An author public key (hex-encoded).
pub type AuthorId = String;

/// Event kind number.
pub type Kind = u32;

/// Well-known kinds and kind classification.
pub mod kind {
    use super::Kind;

    /// Author profile metadata.
    pub const PROFILE: Kind = 0;
    /// Short text note.
    pub const TEXT_NOTE: Kind = 1;
    /// Follow list.
    pub const CONTACTS: Kind = 3;
    /// Deletion request.
    pub const DELETION: Kind = 5;
    /// Repost.
    pub const REPOST: Kind = 6;
    /// Reaction.
    pub const REACTION: Kind = 7;
    /// Horizontal video.
    pub const VIDEO: Kind = 21;
    /// Vertical short-form video.
    pub const SHORT_VIDEO: Kind = 22;
    /// Client authentication event sent in response to a relay challenge.
    pub const CLIENT_AUTH: Kind = 22242;
    /// Addressable horizontal video.
    pub const ADDRESSABLE_VIDEO: Kind = 34235;
    /// Addressable vertical short-form video.
    pub const ADDRESSABLE_SHORT_VIDEO: Kind = 34236;

    /// All kinds that carry a playable video.
    pub const VIDEO_KINDS: [Kind; 4] = [VIDEO, SHORT_VIDEO, ADDRESSABLE_VIDEO, ADDRESSABLE_SHORT_VIDEO];

    /// Storage class of a kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum KindClass {
        /// Every event is kept.
        Regular,
        /// Only the newest event per (author, kind) is current.
        Replaceable,
        /// Not meant to be stored by relays.
        Ephemeral,
        /// Only the newest event per (author, kind, `d` tag) is current.
        Addressable,
    }

    /// Classify a kind.
    #[must_use]
    pub fn classify(kind: Kind) -> KindClass {
        match kind {
            PROFILE | CONTACTS => KindClass::Replaceable,
            10_000..=19_999 => KindClass::Replaceable,
            20_000..=29_999 => KindClass::Ephemeral,
            30_000..=39_999 => KindClass::Addressable,
            _ => KindClass::Regular,
        }
    }

    /// Check whether a kind is a video kind.
    #[must_use]
    pub fn is_video(kind: Kind) -> bool {
        VIDEO_KINDS.contains(&kind)
    }
}

/// A tag expressed as an array of strings: name first, then values.
///
/// Tags are stored verbatim so uncommon or custom tags survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Create a tag from a name and its values.
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fields = vec![name.into()];
        fields.extend(values.into_iter().map(Into::into));
        Self(fields)
    }

    /// Tag name (first element).
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Primary value (second element).
    #[must_use]
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// Additional values after the primary one.
    #[must_use]
    pub fn extras(&self) -> &[String] {
        self.0.get(2..).unwrap_or(&[])
    }
}

/// An immutable signed event.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "npub...",
///   "kind": 22,
///   "created_at": 1700000000,
///   "tags": [["t", "skate"], ["d", "clip-1"]],
///   "content": "kickflip",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier.
    pub id: EventId,
    /// Author public key.
    pub pubkey: AuthorId,
    /// Unix timestamp (seconds) of creation.
    pub created_at: u64,
    /// Kind number.
    pub kind: Kind,
    /// Ordered tags.
    #[serde(default)]
    pub tags: Vec<Tag>,
    /// Content body.
    #[serde(default)]
    pub content: String,
    /// Signature over the id. Verification happens outside this crate.
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Create an unsigned event. Mostly useful for fixtures and local drafts.
    #[must_use]
    pub fn new(
        id: impl Into<EventId>,
        pubkey: impl Into<AuthorId>,
        kind: Kind,
        created_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags: Vec::new(),
            content: String::new(),
            sig: String::new(),
        }
    }

    /// Append a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    /// Set the content.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// All primary values of tags with the given name.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.name() == Some(name))
            .filter_map(Tag::value)
    }

    /// First value of a tag with the given name.
    #[must_use]
    pub fn first_tag_value<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.tag_values(name).next()
    }

    /// Hashtags (`t` tags), lowercased.
    #[must_use]
    pub fn hashtags(&self) -> Vec<String> {
        self.tag_values("t").map(str::to_lowercase).collect()
    }

    /// The `d` tag identifier of an addressable event.
    #[must_use]
    pub fn identifier(&self) -> Option<&str> {
        self.first_tag_value("d")
    }

    /// Storage class of this event's kind.
    #[must_use]
    pub fn kind_class(&self) -> kind::KindClass {
        kind::classify(self.kind)
    }

    /// Address of a replaceable or addressable event: `kind:pubkey:d`.
    ///
    /// Replaceable kinds use an empty identifier. Regular and ephemeral
    /// events have no address.
    #[must_use]
    pub fn address(&self) -> Option<String> {
        match self.kind_class() {
            kind::KindClass::Replaceable => Some(format!("{}:{}:", self.kind, self.pubkey)),
            kind::KindClass::Addressable => Some(format!(
                "{}:{}:{}",
                self.kind,
                self.pubkey,
                self.identifier().unwrap_or_default()
            )),
            _ => None,
        }
    }

    /// Feed ordering: newest first, ties broken by ascending id.
    #[must_use]
    pub fn feed_order(&self, other: &Event) -> Ordering {
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Apply the replaceable-event policy to a result set.
///
/// For every address only the event with the highest `created_at` survives
/// (ties keep the lowest id). Events without an address pass through. The
/// relative order of survivors is preserved.
#[must_use]
pub fn latest_replaceable(events: Vec<Event>) -> Vec<Event> {
    let mut winners: HashMap<String, (u64, EventId)> = HashMap::new();
    for ev in &events {
        if let Some(addr) = ev.address() {
            let candidate = (ev.created_at, ev.id.clone());
            winners
                .entry(addr)
                .and_modify(|best| {
                    if candidate.0 > best.0 || (candidate.0 == best.0 && candidate.1 < best.1) {
                        *best = candidate.clone();
                    }
                })
                .or_insert(candidate);
        }
    }

    events
        .into_iter()
        .filter(|ev| match ev.address() {
            Some(addr) => winners.get(&addr).is_some_and(|(_, id)| *id == ev.id),
            None => true,
        })
        .collect()
}
