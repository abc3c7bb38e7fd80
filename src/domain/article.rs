use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub feed_id: i64,
    pub guid: Option<String>,
    pub link: String,
    pub title: String,
    pub description: String,
    pub date: DateTime<Utc>,
}

impl Article {
    pub fn new(feed_id: i64, link: String) -> Self {
        Self {
            id: 0,
            feed_id,
            guid: None,
            link,
            title: String::new(),
            description: String::new(),
            date: Utc::now(),
        }
    }

    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            "(Untitled)"
        } else {
            &self.title
        }
    }
}

/// Per-user article flag touched by a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleField {
    Read,
    Favor,
}

/// Which articles a state change applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArticleScope {
    Ids(Vec<i64>),
    Feeds(Vec<i64>),
    All,
}

/// Thumbnail extracted for an article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub article_id: i64,
    pub thumbnail: String,
    pub link: String,
}

pub fn article_ids(articles: &[Article]) -> Vec<i64> {
    articles.iter().map(|a| a.id).collect()
}
