pub mod cleanup_html;
pub mod proxy_http;
pub mod relative_url;
pub mod unescape;

use crate::domain::{Article, ParsedFeed};

pub use cleanup_html::CleanupHtml;
pub use proxy_http::ProxyHttp;
pub use relative_url::RelativeUrl;
pub use unescape::Unescape;

/// Transforms a freshly parsed feed before it reaches the repository.
pub trait ParserProcessor: Send + Sync {
    fn process_feed(&self, feed: ParsedFeed) -> ParsedFeed;
}

/// Transforms stored articles on their way out to clients.
pub trait ArticleProcessor: Send + Sync {
    fn process_articles(&self, articles: Vec<Article>) -> Vec<Article>;
}

/// Run `feed` through every processor in order.
pub fn apply_parser_processors(
    processors: &[Box<dyn ParserProcessor>],
    feed: ParsedFeed,
) -> ParsedFeed {
    processors
        .iter()
        .fold(feed, |feed, processor| processor.process_feed(feed))
}

pub fn apply_article_processors(
    processors: &[Box<dyn ArticleProcessor>],
    articles: Vec<Article>,
) -> Vec<Article> {
    processors
        .iter()
        .fold(articles, |articles, processor| {
            processor.process_articles(articles)
        })
}
