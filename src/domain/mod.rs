pub mod article;
pub mod feed;
pub mod parsed;
pub mod subscription;
pub mod tag;
pub mod user;

pub use article::{article_ids, Article, ArticleField, ArticleScope, Thumbnail};
pub use feed::{weekday_name, Feed};
pub use parsed::{ParsedArticle, ParsedFeed};
pub use subscription::{Subscription, SubscriptionState};
pub use tag::Tag;
pub use user::{User, UserFilter, UserProfile};
