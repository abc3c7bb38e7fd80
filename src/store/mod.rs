pub mod eventable;
pub mod sqlite;

use chrono::{DateTime, Utc};

use crate::app::Result;
use crate::domain::{
    Article, ArticleField, ArticleScope, Feed, Subscription, Tag, Thumbnail, User,
};

pub use eventable::EventableStore;
pub use sqlite::SqliteStore;

/// Persistent repository. Every method is safe to call concurrently from
/// multiple tasks.
pub trait Store: Send + Sync {
    // Feed operations
    fn add_feed(&self, feed: &Feed) -> Result<i64>;
    fn get_feed(&self, id: i64) -> Result<Option<Feed>>;
    fn get_feed_by_link(&self, link: &str) -> Result<Option<Feed>>;
    fn get_all_feeds(&self) -> Result<Vec<Feed>>;
    fn get_user_feeds(&self, login: &str) -> Result<Vec<Feed>>;
    fn update_feed(&self, feed: &Feed) -> Result<()>;
    /// Insert the articles that are not yet known for the feed, correcting
    /// title and description of known ones. Returns the inserted articles.
    fn update_feed_articles(&self, feed_id: i64, articles: &[Article]) -> Result<Vec<Article>>;
    fn delete_feed(&self, id: i64) -> Result<()>;
    fn attach_feed(&self, login: &str, feed_id: i64) -> Result<()>;
    fn detach_feed(&self, login: &str, feed_id: i64) -> Result<()>;
    fn count_feed_users(&self, feed_id: i64) -> Result<i64>;

    // Tag operations
    fn get_or_create_tag(&self, owner: &str, value: &str) -> Result<Tag>;
    /// Replace the user's tags on a feed. Returns the stored tags.
    fn set_feed_tags(&self, login: &str, feed_id: i64, values: &[String]) -> Result<Vec<Tag>>;
    fn get_feed_tags(&self, login: &str, feed_id: i64) -> Result<Vec<Tag>>;
    fn get_tag_feed_ids(&self, login: &str, tag_id: i64) -> Result<Vec<i64>>;

    // Article operations
    fn get_article(&self, id: i64) -> Result<Option<Article>>;
    fn get_feed_articles(&self, feed_id: i64) -> Result<Vec<Article>>;
    fn set_article_state(
        &self,
        login: &str,
        field: ArticleField,
        value: bool,
        scope: &ArticleScope,
    ) -> Result<()>;
    fn get_unread_ids(&self, login: &str) -> Result<Vec<i64>>;
    fn get_favorite_ids(&self, login: &str) -> Result<Vec<i64>>;
    /// Drop unread records whose insert date is older than `before`.
    fn delete_stale_unread(&self, before: DateTime<Utc>) -> Result<usize>;

    // User operations
    fn add_user(&self, user: &User) -> Result<()>;
    fn get_user(&self, login: &str) -> Result<Option<User>>;
    fn get_all_users(&self) -> Result<Vec<User>>;
    fn update_user(&self, user: &User) -> Result<()>;

    // Subscription operations
    fn get_subscription(&self, feed_id: i64) -> Result<Option<Subscription>>;
    fn get_all_subscriptions(&self) -> Result<Vec<Subscription>>;
    fn update_subscription(&self, subscription: &Subscription) -> Result<()>;

    // Thumbnail operations
    fn update_thumbnail(&self, thumbnail: &Thumbnail) -> Result<()>;
    fn get_thumbnail(&self, article_id: i64) -> Result<Option<Thumbnail>>;
}
