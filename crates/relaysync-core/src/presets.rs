//! Standard feed definitions.

use relaysync_protocol::{kind, AuthorId, Filter};

/// A named feed and the filters behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSpec {
    /// Feed name.
    pub name: String,
    /// Filter set.
    pub filters: Vec<Filter>,
    /// Page size.
    pub limit: usize,
}

impl FeedSpec {
    /// A feed with arbitrary filters.
    #[must_use]
    pub fn custom(name: impl Into<String>, filters: Vec<Filter>, limit: usize) -> Self {
        Self {
            name: name.into(),
            filters,
            limit,
        }
    }

    /// Every video from everyone.
    #[must_use]
    pub fn discovery(limit: usize) -> Self {
        Self::custom("discovery", vec![videos()], limit)
    }

    /// Videos from followed authors.
    ///
    /// An empty follow list yields a feed that matches nothing, not
    /// everything.
    #[must_use]
    pub fn home<I, S>(follows: I, limit: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<AuthorId>,
    {
        Self::custom("home", vec![videos().authors(follows)], limit)
    }

    /// Videos carrying a hashtag.
    #[must_use]
    pub fn hashtag(tag: &str, limit: usize) -> Self {
        let filter = videos().hashtag(tag);
        let normalized = tag.trim_start_matches('#').to_lowercase();
        Self::custom(format!("hashtag:{normalized}"), vec![filter], limit)
    }

    /// Videos whose content matches a query.
    #[must_use]
    pub fn search(query: &str, limit: usize) -> Self {
        let query = query.trim();
        Self::custom(format!("search:{query}"), vec![videos().search(query)], limit)
    }

    /// Videos by one author, for a profile screen.
    #[must_use]
    pub fn author(pubkey: impl Into<AuthorId>, limit: usize) -> Self {
        let pubkey = pubkey.into();
        Self::custom(
            format!("author:{pubkey}"),
            vec![videos().author(pubkey)],
            limit,
        )
    }
}

fn videos() -> Filter {
    Filter::new().kinds(kind::VIDEO_KINDS)
}
