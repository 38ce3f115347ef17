//! Event filters.
//!
//! A filter is a conjunction of predicates over an event. Set-valued fields
//! are kept sorted so that two filters built in a different order compare,
//! hash and serialise identically.
//!
//! An absent field and an empty set are different predicates: a filter with
//! no `authors` matches any author, while `authors: []` matches none. The
//! canonical key keeps that distinction.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

use crate::event::{AuthorId, Event, EventId, Kind};

/// Filter validation and parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// `since` is later than `until`, so nothing can ever match.
    #[error("since ({since}) is later than until ({until})")]
    InvertedWindow {
        /// Lower bound.
        since: u64,
        /// Upper bound.
        until: u64,
    },

    /// JSON was not a filter object.
    #[error("malformed filter: {0}")]
    Malformed(String),
}

/// A predicate selecting a subset of events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Filter {
    /// Exact event ids.
    pub ids: Option<BTreeSet<EventId>>,
    /// Allowed kinds.
    pub kinds: Option<BTreeSet<Kind>>,
    /// Allowed authors.
    pub authors: Option<BTreeSet<AuthorId>>,
    /// Tag predicates: tag name -> accepted values.
    pub tags: BTreeMap<String, BTreeSet<String>>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<u64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<u64>,
    /// Maximum number of stored results requested. Not part of the predicate.
    pub limit: Option<usize>,
    /// Full-text query over the content.
    pub search: Option<String>,
}

impl Filter {
    /// Create a filter that matches every event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given ids.
    #[must_use]
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<EventId>,
    {
        self.ids
            .get_or_insert_with(BTreeSet::new)
            .extend(ids.into_iter().map(Into::into));
        self
    }

    /// Restrict to one kind (additive).
    #[must_use]
    pub fn kind(self, kind: Kind) -> Self {
        self.kinds([kind])
    }

    /// Restrict to the given kinds (additive).
    #[must_use]
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = Kind>) -> Self {
        self.kinds.get_or_insert_with(BTreeSet::new).extend(kinds);
        self
    }

    /// Restrict to one author (additive).
    #[must_use]
    pub fn author(self, author: impl Into<AuthorId>) -> Self {
        self.authors([author.into()])
    }

    /// Restrict to the given authors (additive).
    ///
    /// Passing an empty iterator still sets the field, producing a filter
    /// that matches no author.
    #[must_use]
    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AuthorId>,
    {
        self.authors
            .get_or_insert_with(BTreeSet::new)
            .extend(authors.into_iter().map(Into::into));
        self
    }

    /// Require a tag with one of the given values. `t` values are stored
    /// lowercased.
    #[must_use]
    pub fn tag<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let hashtags = name == "t";
        self.tags.entry(name).or_default().extend(
            values
                .into_iter()
                .map(Into::into)
                .map(|v: String| if hashtags { v.to_lowercase() } else { v }),
        );
        self
    }

    /// Require a hashtag (`t` tag). Hashtags are matched lowercased.
    #[must_use]
    pub fn hashtag(self, hashtag: impl AsRef<str>) -> Self {
        let normalized = hashtag.as_ref().trim_start_matches('#').to_lowercase();
        self.tag("t", [normalized])
    }

    /// Set the inclusive lower time bound.
    #[must_use]
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Set the inclusive upper time bound.
    #[must_use]
    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    /// Set the result limit.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set a full-text query.
    #[must_use]
    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    /// Copy of this filter bounded to events strictly older than `cursor`.
    ///
    /// The existing `until` is kept when it is already tighter. Returns
    /// `None` when nothing older than `cursor` can exist.
    #[must_use]
    pub fn older_than(&self, cursor: u64) -> Option<Self> {
        let bound = cursor.checked_sub(1)?;
        let mut page = self.clone();
        page.until = Some(self.until.map_or(bound, |u| u.min(bound)));
        if let Some(since) = page.since {
            if since > bound {
                return None;
            }
        }
        Some(page)
    }

    /// Validate that the filter is satisfiable as far as its time window goes.
    ///
    /// # Errors
    ///
    /// Returns an error if `since > until`.
    pub fn validate(&self) -> Result<(), FilterError> {
        match (self.since, self.until) {
            (Some(since), Some(until)) if since > until => {
                Err(FilterError::InvertedWindow { since, until })
            }
            _ => Ok(()),
        }
    }

    /// Evaluate the predicate against an event. `limit` is ignored.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let hit = event.tag_values(name).any(|v| {
                if name == "t" {
                    values.contains(&v.to_lowercase())
                } else {
                    values.contains(v)
                }
            });
            if !hit {
                return false;
            }
        }
        if let Some(query) = &self.search {
            let needle = query.to_lowercase();
            if !event.content.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }

    /// Canonical key over every predicate field except `limit`.
    ///
    /// Two filters have the same key exactly when they select the same
    /// events by construction.
    #[must_use]
    pub fn canonical_key(&self) -> FilterKey {
        fn push_set<T: fmt::Display>(out: &mut String, label: &str, set: &BTreeSet<T>) {
            out.push_str(label);
            out.push_str("=[");
            let parts: Vec<String> = set.iter().map(|v| quote(&v.to_string())).collect();
            out.push_str(&parts.join(","));
            out.push_str("];");
        }

        let mut out = String::new();
        if let Some(ids) = &self.ids {
            push_set(&mut out, "ids", ids);
        }
        if let Some(kinds) = &self.kinds {
            push_set(&mut out, "kinds", kinds);
        }
        if let Some(authors) = &self.authors {
            push_set(&mut out, "authors", authors);
        }
        for (name, values) in &self.tags {
            push_set(&mut out, &format!("#{}", quote(name)), values);
        }
        if let Some(since) = self.since {
            out.push_str(&format!("since={since};"));
        }
        if let Some(until) = self.until {
            out.push_str(&format!("until={until};"));
        }
        if let Some(search) = &self.search {
            out.push_str(&format!("search={};", quote(search)));
        }
        FilterKey(out)
    }

    /// Convert to the JSON object used on the wire.
    #[must_use]
    pub fn to_value(&self) -> Value {
        fn set_value<T: Serialize>(set: &BTreeSet<T>) -> Value {
            serde_json::to_value(set).unwrap_or(Value::Array(Vec::new()))
        }

        let mut obj = Map::new();
        if let Some(ids) = &self.ids {
            obj.insert("ids".into(), set_value(ids));
        }
        if let Some(kinds) = &self.kinds {
            obj.insert("kinds".into(), set_value(kinds));
        }
        if let Some(authors) = &self.authors {
            obj.insert("authors".into(), set_value(authors));
        }
        for (name, values) in &self.tags {
            obj.insert(format!("#{name}"), set_value(values));
        }
        if let Some(since) = self.since {
            obj.insert("since".into(), since.into());
        }
        if let Some(until) = self.until {
            obj.insert("until".into(), until.into());
        }
        if let Some(limit) = self.limit {
            obj.insert("limit".into(), limit.into());
        }
        if let Some(search) = &self.search {
            obj.insert("search".into(), search.clone().into());
        }
        Value::Object(obj)
    }

    /// Parse the JSON object used on the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not an object or a field has the
    /// wrong type. Unknown fields are ignored.
    pub fn from_value(value: &Value) -> Result<Self, FilterError> {
        let obj = value
            .as_object()
            .ok_or_else(|| FilterError::Malformed("expected an object".into()))?;

        let mut filter = Filter::new();
        for (key, val) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(string_set(key, val)?),
                "authors" => filter.authors = Some(string_set(key, val)?),
                "kinds" => {
                    let arr = array(key, val)?;
                    let mut kinds = BTreeSet::new();
                    for v in arr {
                        let k = v
                            .as_u64()
                            .and_then(|k| Kind::try_from(k).ok())
                            .ok_or_else(|| FilterError::Malformed(format!("bad kind {v}")))?;
                        kinds.insert(k);
                    }
                    filter.kinds = Some(kinds);
                }
                "since" => filter.since = Some(uint(key, val)?),
                "until" => filter.until = Some(uint(key, val)?),
                "limit" => filter.limit = Some(uint(key, val)? as usize),
                "search" => {
                    let s = val
                        .as_str()
                        .ok_or_else(|| FilterError::Malformed("search must be a string".into()))?;
                    filter.search = Some(s.to_string());
                }
                tag if tag.starts_with('#') && tag.len() > 1 => {
                    filter = filter.tag(&tag[1..], string_set(key, val)?);
                }
                _ => {}
            }
        }
        Ok(filter)
    }
}

impl From<Filter> for Value {
    fn from(filter: Filter) -> Self {
        filter.to_value()
    }
}

impl TryFrom<Value> for Filter {
    type Error = FilterError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Filter::from_value(&value)
    }
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""))
}

fn array<'a>(key: &str, val: &'a Value) -> Result<&'a Vec<Value>, FilterError> {
    val.as_array()
        .ok_or_else(|| FilterError::Malformed(format!("{key} must be an array")))
}

fn string_set(key: &str, val: &Value) -> Result<BTreeSet<String>, FilterError> {
    array(key, val)?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| FilterError::Malformed(format!("{key} must hold strings")))
        })
        .collect()
}

fn uint(key: &str, val: &Value) -> Result<u64, FilterError> {
    val.as_u64()
        .ok_or_else(|| FilterError::Malformed(format!("{key} must be a non-negative integer")))
}

/// Canonical identity of a single filter's predicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterKey(String);

impl FilterKey {
    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("*")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Canonical identity of a set of filters: order and duplicates do not matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterSetKey(Vec<FilterKey>);

impl FilterSetKey {
    /// Compute the key for a filter set.
    #[must_use]
    pub fn new(filters: &[Filter]) -> Self {
        let mut keys: Vec<FilterKey> = filters.iter().map(Filter::canonical_key).collect();
        keys.sort();
        keys.dedup();
        Self(keys)
    }

    /// Number of distinct filters in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FilterSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(" | "))
    }
}

/// Check whether any filter in a set matches the event.
#[must_use]
pub fn any_match(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use serde_json::json;

    fn video(id: &str, author: &str, at: u64) -> Event {
        Event::new(id, author, 22, at)
    }

    #[test]
    fn test_t_tag_values_match_case_insensitively() {
        let ev = video("e1", "alice", 100).with_tag(Tag::new("t", ["rust"]));
        let upper = video("e2", "alice", 100).with_tag(Tag::new("t", ["Rust"]));

        let filter = Filter::new().tag("t", ["Rust"]);
        assert!(filter.matches(&ev));
        assert!(filter.matches(&upper));
        assert_eq!(filter, Filter::new().hashtag("#rust"));
        assert_eq!(
            Filter::from_value(&json!({"#t": ["RUST"]})).unwrap().canonical_key(),
            filter.canonical_key()
        );

        // Other tags stay case-sensitive.
        let named = video("e3", "alice", 100).with_tag(Tag::new("d", ["Clip"]));
        assert!(Filter::new().tag("d", ["Clip"]).matches(&named));
        assert!(!Filter::new().tag("d", ["clip"]).matches(&named));
    }

    #[test]
    fn test_matches_fields() {
        let ev = video("e1", "alice", 100)
            .with_tag(Tag::new("t", ["Skate"]))
            .with_content("A Kickflip attempt");

        assert!(Filter::new().matches(&ev));
        assert!(Filter::new().kind(22).author("alice").matches(&ev));
        assert!(!Filter::new().kind(21).matches(&ev));
        assert!(!Filter::new().author("bob").matches(&ev));
        assert!(Filter::new().since(100).until(100).matches(&ev));
        assert!(!Filter::new().since(101).matches(&ev));
        assert!(!Filter::new().until(99).matches(&ev));
        assert!(Filter::new().hashtag("#skate").matches(&ev));
        assert!(!Filter::new().hashtag("surf").matches(&ev));
        assert!(Filter::new().search("kickflip").matches(&ev));
        assert!(Filter::new().ids(["e1"]).matches(&ev));
        assert!(!Filter::new().ids(["e2"]).matches(&ev));
    }

    #[test]
    fn test_empty_author_set_matches_nothing() {
        let ev = video("e1", "alice", 1);
        let none: [&str; 0] = [];
        assert!(!Filter::new().authors(none).matches(&ev));
    }

    #[test]
    fn test_canonical_key_is_order_independent() {
        let a = Filter::new().authors(["b", "a"]).kinds([22, 21]);
        let b = Filter::new().kinds([21, 22]).authors(["a", "b"]);
        assert_eq!(a.canonical_key(), b.canonical_key());
    }

    #[test]
    fn test_canonical_key_ignores_limit() {
        let a = Filter::new().kind(22).limit(10);
        let b = Filter::new().kind(22).limit(500);
        assert_eq!(a.canonical_key(), b.canonical_key());
    }

    #[test]
    fn test_canonical_key_distinguishes_author_restriction() {
        let discovery = Filter::new().kinds([21, 22]);
        let home = Filter::new().kinds([21, 22]).author("alice");
        let none: [&str; 0] = [];
        let nobody = Filter::new().kinds([21, 22]).authors(none);

        assert_ne!(discovery.canonical_key(), home.canonical_key());
        assert_ne!(discovery.canonical_key(), nobody.canonical_key());
        assert_ne!(home.canonical_key(), nobody.canonical_key());
    }

    #[test]
    fn test_canonical_key_distinguishes_time_bounds() {
        let a = Filter::new().kind(22).until(100);
        let b = Filter::new().kind(22).until(99);
        let c = Filter::new().kind(22).since(100);
        assert_ne!(a.canonical_key(), b.canonical_key());
        assert_ne!(a.canonical_key(), c.canonical_key());
    }

    #[test]
    fn test_filter_set_key() {
        let a = Filter::new().kind(1);
        let b = Filter::new().kind(22);
        assert_eq!(
            FilterSetKey::new(&[a.clone(), b.clone()]),
            FilterSetKey::new(&[b.clone(), a.clone(), b.clone()])
        );
        assert_ne!(FilterSetKey::new(&[a.clone()]), FilterSetKey::new(&[a, b]));
    }

    #[test]
    fn test_wire_json() {
        let f = Filter::new()
            .kinds([22])
            .author("alice")
            .hashtag("skate")
            .since(5)
            .limit(20);
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(
            json,
            json!({"kinds": [22], "authors": ["alice"], "#t": ["skate"], "since": 5, "limit": 20})
        );

        let parsed: Filter = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, f);
    }

    #[test]
    fn test_from_value_rejects_bad_types() {
        assert!(Filter::from_value(&json!([1, 2])).is_err());
        assert!(Filter::from_value(&json!({"kinds": ["x"]})).is_err());
        assert!(Filter::from_value(&json!({"since": -1})).is_err());
        assert!(Filter::from_value(&json!({"unknown": true})).is_ok());
    }

    #[test]
    fn test_older_than() {
        let f = Filter::new().kind(22).until(50);
        assert_eq!(f.older_than(100).unwrap().until, Some(50));
        assert_eq!(f.older_than(40).unwrap().until, Some(39));
        assert!(f.older_than(0).is_none());
        assert!(Filter::new().since(40).older_than(40).is_none());
    }

    #[test]
    fn test_validate() {
        assert!(Filter::new().since(1).until(2).validate().is_ok());
        assert_eq!(
            Filter::new().since(3).until(2).validate(),
            Err(FilterError::InvertedWindow { since: 3, until: 2 })
        );
    }
}
