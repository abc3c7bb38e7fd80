use serde::{Deserialize, Serialize};

use crate::domain::Article;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    pub name: String,
    pub email: String,
    pub profile: UserProfile,
}

impl User {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            name: String::new(),
            email: String::new(),
            profile: UserProfile::default(),
        }
    }

    /// Whether any of the user's filters hides the article.
    pub fn filters_out(&self, article: &Article) -> bool {
        self.profile
            .filters
            .iter()
            .filter(|f| f.is_valid())
            .any(|f| f.matches(article))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub filters: Vec<UserFilter>,
}

/// A content filter. When bound to a tag, `feed_ids` mirrors the feeds the
/// user has tagged with it and is kept in sync as tags change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserFilter {
    pub tag_id: Option<i64>,
    pub feed_ids: Vec<i64>,
    pub term: String,
    pub match_title: bool,
    pub match_url: bool,
}

impl UserFilter {
    /// A filter needs a term and at least one field to test. A tag-bound
    /// filter whose tag no longer covers any feed is invalid.
    pub fn is_valid(&self) -> bool {
        if self.term.trim().is_empty() || !(self.match_title || self.match_url) {
            return false;
        }
        !(self.tag_id.is_some() && self.feed_ids.is_empty())
    }

    pub fn matches(&self, article: &Article) -> bool {
        if !self.feed_ids.is_empty() && !self.feed_ids.contains(&article.feed_id) {
            return false;
        }

        let term = self.term.to_lowercase();
        (self.match_title && article.title.to_lowercase().contains(&term))
            || (self.match_url && article.link.to_lowercase().contains(&term))
    }
}
