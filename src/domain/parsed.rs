use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc, Weekday};

use crate::domain::{Article, Feed};

/// Output of the feed parser, before it is reconciled with stored state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedFeed {
    pub title: String,
    pub description: String,
    pub site_link: String,
    pub hub_link: Option<String>,
    pub self_link: Option<String>,
    pub ttl: Option<Duration>,
    pub skip_hours: BTreeSet<u32>,
    pub skip_days: HashSet<Weekday>,
    pub articles: Vec<ParsedArticle>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArticle {
    pub guid: Option<String>,
    pub link: String,
    pub title: String,
    pub description: String,
    pub date: DateTime<Utc>,
}

impl ParsedFeed {
    /// Copy parsed metadata onto a stored feed, keeping its identity and link.
    pub fn apply_to(&self, feed: &mut Feed) {
        if !self.title.is_empty() {
            feed.title = self.title.clone();
        }
        if !self.description.is_empty() {
            feed.description = self.description.clone();
        }
        if !self.site_link.is_empty() {
            feed.site_link = self.site_link.clone();
        }
        if self.hub_link.is_some() {
            feed.hub_link = self.hub_link.clone();
        }
        feed.ttl = self.ttl;
        feed.skip_hours = self.skip_hours.clone();
        feed.skip_days = self.skip_days.clone();
    }
}

impl ParsedArticle {
    pub fn into_article(self, feed_id: i64) -> Article {
        Article {
            id: 0,
            feed_id,
            guid: self.guid.filter(|g| !g.is_empty()),
            link: self.link,
            title: self.title,
            description: self.description,
            date: self.date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_keeps_existing_values_when_empty() {
        let mut feed = Feed::new("https://example.com/feed.xml".into());
        feed.title = "Old".into();

        let parsed = ParsedFeed {
            description: "New description".into(),
            ttl: Some(Duration::from_secs(600)),
            ..Default::default()
        };
        parsed.apply_to(&mut feed);

        assert_eq!(feed.title, "Old");
        assert_eq!(feed.description, "New description");
        assert_eq!(feed.ttl, Some(Duration::from_secs(600)));
        assert_eq!(feed.link, "https://example.com/feed.xml");
    }

    #[test]
    fn test_into_article_drops_empty_guid() {
        let parsed = ParsedArticle {
            guid: Some(String::new()),
            link: "https://example.com/a".into(),
            title: "A".into(),
            description: String::new(),
            date: Utc::now(),
        };
        let article = parsed.into_article(4);
        assert_eq!(article.feed_id, 4);
        assert_eq!(article.guid, None);
    }
}
