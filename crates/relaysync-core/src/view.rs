//! Ordered, deduplicated event sequence backing one feed.

use relaysync_protocol::{Event, EventId};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

type ViewKey = (Reverse<u64>, EventId);

/// Events of one feed, newest first.
///
/// Ordering is by `created_at` descending with ties broken by id, no matter
/// in which order events arrive. An id is held at most once. Items are never
/// removed, so the cursor (the oldest `created_at`) only ever moves back in
/// time.
#[derive(Debug, Clone)]
pub struct FeedView {
    items: BTreeMap<ViewKey, Arc<Event>>,
    ids: HashSet<EventId>,
    has_more: bool,
}

impl Default for FeedView {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedView {
    /// Create an empty view. A new view assumes there is more to page in.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            ids: HashSet::new(),
            has_more: true,
        }
    }

    /// Insert an event. Returns `false` if its id is already present.
    pub fn insert(&mut self, event: Arc<Event>) -> bool {
        if !self.ids.insert(event.id.clone()) {
            return false;
        }
        self.items
            .insert((Reverse(event.created_at), event.id.clone()), event);
        true
    }

    /// Insert several events. Returns how many were new.
    pub fn extend(&mut self, events: impl IntoIterator<Item = Arc<Event>>) -> usize {
        events.into_iter().filter(|e| self.insert(Arc::clone(e))).count()
    }

    /// Check whether an id is present.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// `created_at` of the oldest event.
    #[must_use]
    pub fn cursor(&self) -> Option<u64> {
        self.items.keys().next_back().map(|(Reverse(at), _)| *at)
    }

    /// Events in feed order.
    #[must_use]
    pub fn events(&self) -> Vec<Arc<Event>> {
        self.items.values().cloned().collect()
    }

    /// Whether older events may still exist.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    /// Record whether older events may still exist.
    pub fn set_has_more(&mut self, has_more: bool) {
        self.has_more = has_more;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaysync_protocol::kind;

    fn video(id: &str, at: u64) -> Arc<Event> {
        Arc::new(Event::new(id, "alice", kind::SHORT_VIDEO, at))
    }

    fn ids(view: &FeedView) -> Vec<String> {
        view.events().iter().map(|e| e.id.clone()).collect()
    }

    #[test]
    fn test_orders_regardless_of_arrival() {
        let mut view = FeedView::new();
        view.insert(video("b", 20));
        view.insert(video("a", 30));
        view.insert(video("d", 10));
        view.insert(video("c", 20));
        assert_eq!(ids(&view), vec!["a", "b", "c", "d"]);
        assert_eq!(view.cursor(), Some(10));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let mut view = FeedView::new();
        assert!(view.insert(video("a", 10)));
        assert!(!view.insert(video("a", 10)));
        assert_eq!(view.extend([video("a", 10), video("b", 5), video("b", 5)]), 1);
        assert_eq!(view.len(), 2);
        assert!(view.contains("b"));
    }

    #[test]
    fn test_cursor_never_moves_forward() {
        let mut view = FeedView::new();
        assert_eq!(view.cursor(), None);
        view.insert(video("a", 50));
        let mut last = view.cursor().unwrap();
        for (i, at) in [60, 40, 70, 30, 45].into_iter().enumerate() {
            view.insert(video(&format!("e{i}"), at));
            let cursor = view.cursor().unwrap();
            assert!(cursor <= last);
            last = cursor;
        }
        assert_eq!(last, 30);
    }

    #[test]
    fn test_has_more_flag() {
        let mut view = FeedView::default();
        assert!(view.has_more());
        view.set_has_more(false);
        assert!(!view.has_more());
        assert!(view.is_empty());
    }
}
