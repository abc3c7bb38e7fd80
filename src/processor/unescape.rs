use crate::domain::ParsedFeed;
use crate::processor::ParserProcessor;

/// Decodes HTML entities left in feed and article titles.
#[derive(Debug, Default)]
pub struct Unescape;

impl ParserProcessor for Unescape {
    fn process_feed(&self, mut feed: ParsedFeed) -> ParsedFeed {
        feed.title = html_escape::decode_html_entities(&feed.title).into_owned();

        for article in &mut feed.articles {
            article.title = html_escape::decode_html_entities(&article.title).into_owned();
        }

        feed
    }
}
