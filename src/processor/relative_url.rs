use regex::{Captures, Regex};
use url::Url;

use crate::app::Result;
use crate::domain::ParsedFeed;
use crate::processor::ParserProcessor;

/// Resolves relative article links and `src`/`href` attributes against the
/// feed's site link.
pub struct RelativeUrl {
    attribute: Regex,
}

impl RelativeUrl {
    pub fn new() -> Result<Self> {
        Ok(Self {
            attribute: Regex::new(r#"(?i)\b(src|href)\s*=\s*"([^"]*)""#)?,
        })
    }

    fn resolve(base: &Url, link: &str) -> Option<String> {
        if link.is_empty() || Url::parse(link).is_ok() {
            return None;
        }
        base.join(link).ok().map(String::from)
    }
}

impl ParserProcessor for RelativeUrl {
    fn process_feed(&self, mut feed: ParsedFeed) -> ParsedFeed {
        let base = feed
            .self_link
            .as_deref()
            .filter(|_| feed.site_link.is_empty())
            .unwrap_or(&feed.site_link);
        let Ok(base) = Url::parse(base) else {
            return feed;
        };

        for article in &mut feed.articles {
            if let Some(link) = Self::resolve(&base, &article.link) {
                article.link = link;
            }

            let description = self
                .attribute
                .replace_all(&article.description, |caps: &Captures| {
                    match Self::resolve(&base, &caps[2]) {
                        Some(link) => format!(r#"{}="{}""#, &caps[1], link),
                        None => caps[0].to_string(),
                    }
                })
                .into_owned();
            article.description = description;
        }

        feed
    }
}
