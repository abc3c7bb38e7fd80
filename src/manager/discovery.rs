use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};
use url::{form_urlencoded, Url};

use crate::app::{EstuaryError, Result};
use crate::domain::ParsedFeed;
use crate::fetcher::Fetcher;
use crate::parser::parse_feed;

/// Feed MIME types accepted in `<link rel="alternate">` tags.
const FEED_TYPES: [&str; 3] = [
    "application/rss+xml",
    "application/atom+xml",
    "application/rdf+xml",
];

/// How many search results are inspected for feeds.
const SEARCH_RESULTS: usize = 5;

/// A feed found at some URL, with its parsed content.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub link: String,
    pub parsed: ParsedFeed,
}

/// Web search used when a discovery query is not a URL.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Result page links for `query`, best first.
    async fn search(&self, query: &str) -> Result<Vec<String>>;
}

/// Scrapes result links from an HTML search page.
pub struct HttpSearchEngine {
    fetcher: Arc<dyn Fetcher>,
    template: String,
    anchor: Regex,
}

impl HttpSearchEngine {
    /// `template` is the search page URL with a `{query}` placeholder.
    pub fn new(fetcher: Arc<dyn Fetcher>, template: &str) -> Result<Self> {
        if !template.contains("{query}") {
            return Err(EstuaryError::Config(format!(
                "search url '{}' has no {{query}} placeholder",
                template
            )));
        }

        Ok(Self {
            fetcher,
            template: template.to_string(),
            anchor: Regex::new(r#"(?i)<a\b[^>]*?\bhref\s*=\s*["'](https?://[^"']+)["']"#)?,
        })
    }
}

#[async_trait]
impl SearchEngine for HttpSearchEngine {
    async fn search(&self, query: &str) -> Result<Vec<String>> {
        let encoded: String = form_urlencoded::byte_serialize(query.as_bytes()).collect();
        let search_url = self.template.replace("{query}", &encoded);
        let search_host = Url::parse(&search_url)?.host_str().map(str::to_string);

        let response = self.fetcher.fetch(&search_url).await?;
        if !response.is_ok() {
            return Err(EstuaryError::Other(format!(
                "search returned HTTP status {}",
                response.status
            )));
        }

        let html = String::from_utf8_lossy(&response.body);
        let mut seen = HashSet::new();
        let links = self
            .anchor
            .captures_iter(&html)
            .map(|caps| html_escape::decode_html_entities(&caps[1]).into_owned())
            .filter(|link| {
                let host = Url::parse(link).ok().and_then(|u| u.host_str().map(str::to_string));
                host.is_some() && host != search_host
            })
            .filter(|link| seen.insert(link.clone()))
            .take(SEARCH_RESULTS)
            .collect();

        Ok(links)
    }
}

/// Finds feeds behind URLs and search queries.
pub struct Discovery {
    fetcher: Arc<dyn Fetcher>,
    search: Option<Arc<dyn SearchEngine>>,
    link_tag: Regex,
    attribute: Regex,
}

impl Discovery {
    pub fn new(fetcher: Arc<dyn Fetcher>, search: Option<Arc<dyn SearchEngine>>) -> Result<Self> {
        Ok(Self {
            fetcher,
            search,
            link_tag: Regex::new(r"(?is)<link\b[^>]*>")?,
            attribute: Regex::new(r#"(?is)\b(rel|type|href)\s*=\s*["']([^"']*)["']"#)?,
        })
    }

    /// Discover feeds for a URL or, failing that, a search query.
    pub async fn discover(&self, query: &str) -> Result<Vec<Discovered>> {
        let query = query.trim();
        if let Ok(url) = Url::parse(query) {
            if matches!(url.scheme(), "http" | "https") {
                return self.discover_url(url.as_str()).await;
            }
        }

        let Some(search) = &self.search else {
            return Err(EstuaryError::InvalidInput(format!(
                "'{}' is not a URL and search is not configured",
                query
            )));
        };

        let mut found = Vec::new();
        for link in search.search(query).await? {
            match self.discover_url(&link).await {
                Ok(feeds) => push_unique(&mut found, feeds),
                Err(e) => debug!(url = %link, error = %e, "No feed at search result"),
            }
        }
        Ok(found)
    }

    /// The document at `url` itself when it is a feed, otherwise the feeds
    /// its HTML advertises as alternates.
    pub async fn discover_url(&self, url: &str) -> Result<Vec<Discovered>> {
        let response = self.fetcher.fetch(url).await?;
        if !response.is_ok() {
            return Err(EstuaryError::InvalidFeed(format!(
                "{}: HTTP Status: {}",
                url, response.status
            )));
        }

        if let Ok(parsed) = parse_feed(&response.body) {
            return Ok(vec![Discovered {
                link: url.to_string(),
                parsed,
            }]);
        }

        let base = Url::parse(url)?;
        let html = String::from_utf8_lossy(&response.body);
        let mut found = Vec::new();

        for link in self.alternate_links(&html, &base) {
            match self.fetcher.fetch(&link).await {
                Ok(response) if response.is_ok() => match parse_feed(&response.body) {
                    Ok(parsed) => push_unique(&mut found, vec![Discovered { link, parsed }]),
                    Err(e) => debug!(url = %link, error = %e, "Alternate is not a feed"),
                },
                Ok(response) => {
                    debug!(url = %link, status = response.status, "Alternate not reachable")
                }
                Err(e) => warn!(url = %link, error = %e, "Failed to fetch alternate"),
            }
        }

        Ok(found)
    }

    /// Absolute hrefs of `<link rel="alternate">` tags with a feed type.
    pub fn alternate_links(&self, html: &str, base: &Url) -> Vec<String> {
        let mut links = Vec::new();

        for tag in self.link_tag.find_iter(html) {
            let (mut rel, mut kind, mut href) = (None, None, None);
            for caps in self.attribute.captures_iter(tag.as_str()) {
                let value = caps[2].trim().to_string();
                match caps[1].to_ascii_lowercase().as_str() {
                    "rel" => rel = Some(value.to_ascii_lowercase()),
                    "type" => kind = Some(value.to_ascii_lowercase()),
                    _ => href = Some(value),
                }
            }

            let is_alternate = rel
                .as_deref()
                .is_some_and(|r| r.split_whitespace().any(|r| r == "alternate"));
            let is_feed = kind.as_deref().is_some_and(|k| FEED_TYPES.contains(&k));
            if !(is_alternate && is_feed) {
                continue;
            }

            let Some(href) = href else { continue };
            let href = html_escape::decode_html_entities(&href);
            if let Ok(link) = base.join(&href) {
                let link = link.to_string();
                if !links.contains(&link) {
                    links.push(link);
                }
            }
        }

        links
    }
}

fn push_unique(found: &mut Vec<Discovered>, feeds: Vec<Discovered>) {
    for feed in feeds {
        if !found.iter().any(|f| f.link == feed.link) {
            found.push(feed);
        }
    }
}
