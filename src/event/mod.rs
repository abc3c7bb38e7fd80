pub mod bus;

use std::fmt;

use crate::domain::{Article, ArticleField, ArticleScope, Feed, Tag, User};

pub use bus::EventBus;

/// Buffer of every listener channel.
pub const LISTENER_BUFFER: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    FeedUpdate,
    FeedDelete,
    FeedSetTags,
    ArticleState,
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventName::FeedUpdate => "feed-update",
            EventName::FeedDelete => "feed-delete",
            EventName::FeedSetTags => "feed-set-tags",
            EventName::ArticleState => "article-state",
        };
        f.write_str(name)
    }
}

/// A feed lifecycle notification. Only successful mutations produce one.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    FeedUpdate {
        feed: Feed,
        articles: Vec<Article>,
    },
    FeedDelete {
        feed: Feed,
    },
    FeedSetTags {
        feed: Feed,
        user: User,
        tags: Vec<Tag>,
    },
    ArticleState {
        user: User,
        field: ArticleField,
        value: bool,
        scope: ArticleScope,
    },
}

impl Event {
    pub fn name(&self) -> EventName {
        match self {
            Event::FeedUpdate { .. } => EventName::FeedUpdate,
            Event::FeedDelete { .. } => EventName::FeedDelete,
            Event::FeedSetTags { .. } => EventName::FeedSetTags,
            Event::ArticleState { .. } => EventName::ArticleState,
        }
    }
}
