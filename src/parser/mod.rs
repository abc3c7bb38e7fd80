//! Feed document parsing.
//!
//! Formats are attempted in a fixed order: RSS 2.0, then Atom, then RSS 1.0.
//! The first parser that accepts the document wins.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc, Weekday};
use feed_rs::model::{Feed as GenericFeed, FeedType};

use crate::app::{EstuaryError, Result};
use crate::domain::{ParsedArticle, ParsedFeed};

pub fn parse_feed(body: &[u8]) -> Result<ParsedFeed> {
    if root_element(body).as_deref() == Some("rss") {
        if let Ok(channel) = rss::Channel::read_from(body) {
            return Ok(from_rss2(&channel));
        }
    }

    let feed =
        feed_rs::parser::parse(body).map_err(|e| EstuaryError::FeedParse(e.to_string()))?;

    match feed.feed_type {
        FeedType::Atom | FeedType::RSS1 | FeedType::RSS0 | FeedType::RSS2 => {
            Ok(from_generic(feed))
        }
        FeedType::JSON => Err(EstuaryError::FeedParse(
            "JSON feeds are not supported".to_string(),
        )),
    }
}

fn from_rss2(channel: &rss::Channel) -> ParsedFeed {
    let mut parsed = ParsedFeed {
        title: channel.title().trim().to_string(),
        description: channel.description().trim().to_string(),
        site_link: channel.link().trim().to_string(),
        ttl: channel
            .ttl()
            .and_then(|t| t.trim().parse::<u64>().ok())
            .map(|minutes| Duration::from_secs(minutes * 60)),
        skip_hours: parse_skip_hours(channel.skip_hours()),
        skip_days: parse_skip_days(channel.skip_days()),
        ..Default::default()
    };

    if let Some(atom) = channel.atom_ext() {
        for link in atom.links() {
            match link.rel() {
                "hub" => parsed.hub_link = Some(link.href().to_string()),
                "self" => parsed.self_link = Some(link.href().to_string()),
                _ => {}
            }
        }
    }

    parsed.articles = channel
        .items()
        .iter()
        .map(|item| ParsedArticle {
            guid: item.guid().map(|g| g.value().trim().to_string()),
            link: item.link().unwrap_or_default().trim().to_string(),
            title: item.title().unwrap_or_default().trim().to_string(),
            description: item
                .content()
                .or(item.description())
                .unwrap_or_default()
                .to_string(),
            date: item
                .pub_date()
                .and_then(|d| DateTime::parse_from_rfc2822(d.trim()).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        })
        .collect();

    parsed
}

fn from_generic(feed: GenericFeed) -> ParsedFeed {
    let mut parsed = ParsedFeed {
        title: feed.title.map(|t| t.content).unwrap_or_default(),
        description: feed.description.map(|d| d.content).unwrap_or_default(),
        ttl: feed.ttl.map(|minutes| Duration::from_secs(u64::from(minutes) * 60)),
        ..Default::default()
    };

    for link in &feed.links {
        match link.rel.as_deref() {
            Some("hub") => parsed.hub_link = Some(link.href.clone()),
            Some("self") => parsed.self_link = Some(link.href.clone()),
            Some("alternate") | None if parsed.site_link.is_empty() => {
                parsed.site_link = link.href.clone();
            }
            _ => {}
        }
    }

    parsed.articles = feed
        .entries
        .into_iter()
        .map(|entry| {
            let link = entry
                .links
                .iter()
                .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
                .or(entry.links.first())
                .map(|l| l.href.clone())
                .unwrap_or_default();

            ParsedArticle {
                guid: Some(entry.id).filter(|id| !id.is_empty()),
                link,
                title: entry.title.map(|t| t.content).unwrap_or_default(),
                description: entry
                    .content
                    .and_then(|c| c.body)
                    .or(entry.summary.map(|s| s.content))
                    .unwrap_or_default(),
                date: entry
                    .published
                    .or(entry.updated)
                    .unwrap_or_else(Utc::now),
            }
        })
        .collect();

    parsed
}

/// Name of the document's root element, skipping the prolog and comments.
fn root_element(body: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(&body[..body.len().min(4096)]);
    let mut rest = text.as_ref();
    loop {
        let start = rest.find('<')?;
        rest = &rest[start + 1..];
        if rest.starts_with('?') || rest.starts_with('!') {
            continue;
        }
        let name: String = rest
            .chars()
            .take_while(|c| !c.is_whitespace() && *c != '>' && *c != '/')
            .collect();
        return Some(name.to_lowercase());
    }
}

fn parse_skip_hours(hours: &[String]) -> BTreeSet<u32> {
    hours
        .iter()
        .filter_map(|h| h.trim().parse::<u32>().ok())
        .map(|h| if h == 24 { 0 } else { h })
        .filter(|h| *h < 24)
        .collect()
}

fn parse_skip_days(days: &[String]) -> HashSet<Weekday> {
    days.iter()
        .filter_map(|d| d.trim().parse::<Weekday>().ok())
        .collect()
}
