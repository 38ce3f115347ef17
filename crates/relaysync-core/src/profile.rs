//! Author profiles projected from profile metadata events.

use relaysync_protocol::{AuthorId, Event, EventId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Latest known profile of an author.
///
/// Built from the JSON content of a profile metadata event. Well-known fields
/// are lifted out; everything else is preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Author the profile belongs to.
    pub pubkey: AuthorId,
    /// Event the profile was built from.
    pub event_id: EventId,
    /// `created_at` of that event.
    pub created_at: u64,
    /// Short handle.
    pub name: Option<String>,
    /// Display name.
    pub display_name: Option<String>,
    /// Bio.
    pub about: Option<String>,
    /// Avatar URL.
    pub picture: Option<String>,
    /// Banner URL.
    pub banner: Option<String>,
    /// Web identifier (`name@domain`).
    pub nip05: Option<String>,
    /// Lightning address.
    pub lud16: Option<String>,
    /// Website.
    pub website: Option<String>,
    /// Unrecognised fields.
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl Profile {
    /// Parse a profile from a metadata event.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not a JSON object.
    pub fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        let mut fields: Map<String, Value> = serde_json::from_str(&event.content)?;

        let mut take = |keys: &[&str]| -> Option<String> {
            let mut found = None;
            for key in keys {
                if let Some(value) = fields.remove(*key) {
                    if found.is_none() {
                        found = value.as_str().map(str::to_string).filter(|s| !s.is_empty());
                    }
                }
            }
            found
        };

        Ok(Self {
            pubkey: event.pubkey.clone(),
            event_id: event.id.clone(),
            created_at: event.created_at,
            name: take(&["name", "username"]),
            display_name: take(&["display_name", "displayName"]),
            about: take(&["about"]),
            picture: take(&["picture", "image"]),
            banner: take(&["banner"]),
            nip05: take(&["nip05"]),
            lud16: take(&["lud16"]),
            website: take(&["website"]),
            extra: fields,
        })
    }

    /// Best human-readable name: display name, then name, then a short key.
    #[must_use]
    pub fn best_name(&self) -> String {
        self.display_name
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| self.pubkey.chars().take(8).collect())
    }

    /// Check whether this profile should replace `other`.
    ///
    /// Only a strictly newer event replaces a stored profile.
    #[must_use]
    pub fn supersedes(&self, other: &Profile) -> bool {
        self.created_at > other.created_at
    }
}
