//! Bridges scheduler output to the repository.
//!
//! The manager owns the set of active feeds: it schedules every stored feed
//! on start, turns each update into repository writes, and tells the
//! registered [`FeedMonitor`]s about new articles and deleted feeds.

pub mod discovery;

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::{EstuaryError, Result};
use crate::domain::{Article, Feed, ParsedFeed};
use crate::fetcher::Fetcher;
use crate::hubbub::Hubbub;
use crate::processor::{
    apply_article_processors, apply_parser_processors, ArticleProcessor, ParserProcessor,
};
use crate::scheduler::{Scheduler, UpdateData};
use crate::store::{EventableStore, Store};

pub use discovery::{Discovered, Discovery, HttpSearchEngine, SearchEngine};

/// Told about feed lifecycle changes by the manager.
#[async_trait]
pub trait FeedMonitor: Send + Sync {
    async fn feed_updated(&self, feed: &Feed, articles: &[Article]) -> Result<()>;
    async fn feed_deleted(&self, feed: &Feed) -> Result<()>;
}

pub struct FeedManager {
    store: EventableStore,
    scheduler: Scheduler,
    discovery: Discovery,
    update_interval: Duration,
    parser_processors: Vec<Box<dyn ParserProcessor>>,
    article_processors: Vec<Box<dyn ArticleProcessor>>,
    monitors: Vec<Arc<dyn FeedMonitor>>,
    hubbub: Option<Arc<Hubbub>>,
    hub_updates: Mutex<Option<mpsc::Receiver<UpdateData>>>,
    token: OnceLock<CancellationToken>,
}

impl FeedManager {
    pub fn new(
        store: EventableStore,
        fetcher: Arc<dyn Fetcher>,
        discovery: Discovery,
        update_interval: Duration,
    ) -> Self {
        Self {
            store,
            scheduler: Scheduler::new(fetcher),
            discovery,
            update_interval,
            parser_processors: Vec::new(),
            article_processors: Vec::new(),
            monitors: Vec::new(),
            hubbub: None,
            hub_updates: Mutex::new(None),
            token: OnceLock::new(),
        }
    }

    pub fn add_parser_processor(&mut self, processor: Box<dyn ParserProcessor>) {
        self.parser_processors.push(processor);
    }

    pub fn add_article_processor(&mut self, processor: Box<dyn ArticleProcessor>) {
        self.article_processors.push(processor);
    }

    pub fn add_feed_monitor(&mut self, monitor: Arc<dyn FeedMonitor>) {
        self.monitors.push(monitor);
    }

    /// Use `hubbub` for feeds that advertise a hub; `updates` carries the
    /// content it receives from hubs.
    pub fn set_hubbub(&mut self, hubbub: Arc<Hubbub>, updates: mpsc::Receiver<UpdateData>) {
        self.hubbub = Some(hubbub);
        self.hub_updates = Mutex::new(Some(updates));
    }

    pub fn store(&self) -> &EventableStore {
        &self.store
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn hubbub(&self) -> Option<&Arc<Hubbub>> {
        self.hubbub.as_ref()
    }

    /// Schedule every stored feed and start consuming hub pushes.
    pub async fn start(self: &Arc<Self>, token: CancellationToken) -> Result<()> {
        if self.token.set(token.clone()).is_err() {
            warn!("Feed manager already started");
            return Ok(());
        }

        self.scheduler.start(token.clone());

        let feeds = self.store.inner().get_all_feeds()?;
        info!(count = feeds.len(), "Starting feed manager");
        for feed in feeds {
            self.schedule(&token, feed).await;
        }

        let hub_updates = self.hub_updates.lock().ok().and_then(|mut rx| rx.take());
        if let Some(rx) = hub_updates {
            let manager = Arc::clone(self);
            let token = token.clone();
            tokio::spawn(async move { manager.read_updates(rx, token).await });
        }

        if let Some(hubbub) = &self.hubbub {
            if let Err(e) = hubbub.init_subscriptions() {
                error!(error = %e, "Failed to initialize hub subscriptions");
            }
        }

        Ok(())
    }

    pub async fn add_feed_by_link(self: &Arc<Self>, link: &str) -> Result<Feed> {
        self.add_feed_for_user(link, None).await
    }

    /// Add the feed at `link`, or the feed its page advertises, and attach it
    /// to `login` when given. Known feeds are only attached.
    pub async fn add_feed_for_user(
        self: &Arc<Self>,
        link: &str,
        login: Option<&str>,
    ) -> Result<Feed> {
        let link = link.trim();
        if link.is_empty() {
            return Err(EstuaryError::InvalidInput("empty feed link".to_string()));
        }

        if let Some(feed) = self.existing(link, login)? {
            return Ok(feed);
        }

        let discovered = self
            .discovery
            .discover_url(link)
            .await
            .map_err(|e| match e {
                EstuaryError::InvalidFeed(_) => e,
                other => EstuaryError::InvalidFeed(format!("{}: {}", link, other)),
            })?;
        let Some(Discovered { link: feed_link, parsed }) = discovered.into_iter().next() else {
            return Err(EstuaryError::InvalidFeed(format!("no feed found at {}", link)));
        };

        if feed_link != link {
            if let Some(feed) = self.existing(&feed_link, login)? {
                return Ok(feed);
            }
        }

        let parsed = apply_parser_processors(&self.parser_processors, parsed);
        let mut feed = Feed::new(feed_link);
        parsed.apply_to(&mut feed);
        feed.id = self.store.inner().add_feed(&feed)?;
        info!(feed_id = feed.id, url = %feed.link, "Feed added");

        if let Some(login) = login {
            self.store.inner().attach_feed(login, feed.id)?;
        }

        let inserted = self
            .store
            .update_feed_articles(&feed, &to_articles(parsed, feed.id))
            .await?;
        if !inserted.is_empty() {
            self.notify_updated(&feed, &inserted).await;
        }

        match self.token.get() {
            Some(token) => self.schedule(token, feed.clone()).await,
            None => debug!(feed_id = feed.id, "Manager not started, feed scheduled on start"),
        }
        self.subscribe(&mut feed).await;

        Ok(feed)
    }

    fn existing(&self, link: &str, login: Option<&str>) -> Result<Option<Feed>> {
        let Some(feed) = self.store.inner().get_feed_by_link(link)? else {
            return Ok(None);
        };

        if let Some(login) = login {
            self.store.inner().attach_feed(login, feed.id)?;
            debug!(feed_id = feed.id, user = login, "Attached existing feed");
        }
        Ok(Some(feed))
    }

    /// Stop polling `feed`, drop its hub subscription and delete it.
    pub async fn remove_feed(&self, feed: &Feed) -> Result<()> {
        if let Some(hubbub) = &self.hubbub {
            if let Err(e) = hubbub.unsubscribe(feed).await {
                warn!(feed_id = feed.id, error = %e, "Failed to unsubscribe from hub");
            }
        }

        // The scheduler only answers once its control loop runs.
        if self.token.get().is_some() {
            self.scheduler.unschedule(feed.id).await?;
        }

        let results = join_all(self.monitors.iter().map(|m| m.feed_deleted(feed))).await;
        for e in results.into_iter().filter_map(|r| r.err()) {
            error!(feed_id = feed.id, error = %e, "Feed monitor failed on delete");
        }

        self.store.delete_feed(feed).await?;
        info!(feed_id = feed.id, url = %feed.link, "Feed removed");
        Ok(())
    }

    /// Feeds found for a URL or search query. They are not stored.
    pub async fn discover_feeds(&self, query: &str) -> Result<Vec<Feed>> {
        let discovered = self.discovery.discover(query).await?;

        Ok(discovered
            .into_iter()
            .map(|Discovered { link, parsed }| {
                let parsed = apply_parser_processors(&self.parser_processors, parsed);
                let mut feed = Feed::new(link);
                parsed.apply_to(&mut feed);
                feed
            })
            .collect())
    }

    /// Stored articles of a feed, as served to clients.
    pub fn feed_articles(&self, feed_id: i64) -> Result<Vec<Article>> {
        let articles = self.store.inner().get_feed_articles(feed_id)?;
        Ok(apply_article_processors(&self.article_processors, articles))
    }

    async fn schedule(self: &Arc<Self>, token: &CancellationToken, feed: Feed) {
        let rx = self
            .scheduler
            .schedule_feed(token, feed, self.update_interval)
            .await;

        let manager = Arc::clone(self);
        let token = token.clone();
        tokio::spawn(async move { manager.read_updates(rx, token).await });
    }

    /// Updates of one stream are processed one after the other.
    async fn read_updates(&self, mut rx: mpsc::Receiver<UpdateData>, token: CancellationToken) {
        loop {
            let update = tokio::select! {
                _ = token.cancelled() => break,
                update = rx.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            self.process_update(update).await;
        }
    }

    async fn process_update(&self, update: UpdateData) {
        let feed_id = update.feed.id;

        // Reload so the update never resurrects a removed feed or
        // overwrites fields the scheduler does not track.
        let mut feed = match self.store.inner().get_feed(feed_id) {
            Ok(Some(feed)) => feed,
            Ok(None) => {
                debug!(feed_id, "Dropping update for removed feed");
                return;
            }
            Err(e) => {
                error!(feed_id, error = %e, "Failed to load feed");
                return;
            }
        };

        let parsed = match update.result {
            Ok(parsed) => parsed,
            Err(message) => {
                warn!(feed_id, error = %message, "Feed update failed");
                feed.update_error = message;
                if let Err(e) = self.store.inner().update_feed(&feed) {
                    error!(feed_id, error = %e, "Failed to record update error");
                }
                return;
            }
        };

        let parsed = apply_parser_processors(&self.parser_processors, parsed);
        parsed.apply_to(&mut feed);
        feed.update_error.clear();
        if let Err(e) = self.store.inner().update_feed(&feed) {
            error!(feed_id, error = %e, "Failed to update feed");
            return;
        }

        match self
            .store
            .update_feed_articles(&feed, &to_articles(parsed, feed_id))
            .await
        {
            Ok(inserted) if !inserted.is_empty() => {
                debug!(feed_id, new_articles = inserted.len(), "Feed updated");
                self.notify_updated(&feed, &inserted).await;
            }
            Ok(_) => {}
            Err(e) => {
                error!(feed_id, error = %e, "Failed to store articles");
                return;
            }
        }

        self.subscribe(&mut feed).await;
    }

    async fn notify_updated(&self, feed: &Feed, articles: &[Article]) {
        let results = join_all(
            self.monitors
                .iter()
                .map(|m| m.feed_updated(feed, articles)),
        )
        .await;

        for e in results.into_iter().filter_map(|r| r.err()) {
            error!(feed_id = feed.id, error = %e, "Feed monitor failed on update");
        }
    }

    /// Ask the feed's hub for a subscription unless one is already on record.
    async fn subscribe(&self, feed: &mut Feed) {
        let Some(hubbub) = &self.hubbub else { return };
        if feed.hub_link.as_deref().map_or(true, str::is_empty) {
            return;
        }

        match self.store.inner().get_subscription(feed.id) {
            Ok(None) => {}
            Ok(Some(_)) => return,
            Err(e) => {
                error!(feed_id = feed.id, error = %e, "Failed to load subscription");
                return;
            }
        }

        let subscribe_error = match hubbub.subscribe(feed).await {
            Ok(()) => String::new(),
            Err(e) => e.to_string(),
        };
        if subscribe_error != feed.subscribe_error {
            feed.subscribe_error = subscribe_error;
            if let Err(e) = self.store.inner().update_feed(feed) {
                error!(feed_id = feed.id, error = %e, "Failed to record subscribe error");
            }
        }
    }
}

fn to_articles(parsed: ParsedFeed, feed_id: i64) -> Vec<Article> {
    parsed
        .articles
        .into_iter()
        .map(|a| a.into_article(feed_id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::User;
    use crate::event::{Event, EventBus};
    use crate::fetcher::FetchResponse;
    use crate::store::SqliteStore;
    use std::collections::HashMap;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Example</title><link>https://example.com/</link>
<item><guid>1</guid><title>One</title><link>https://example.com/1</link></item>
<item><guid>2</guid><title>Two</title><link>https://example.com/2</link></item>
</channel></rss>"#;

    const PAGE: &str = r#"<html><head>
<link rel="alternate" type="application/rss+xml" href="/feed.xml">
</head><body>Hello</body></html>"#;

    struct MapFetcher(HashMap<String, (u16, String)>);

    impl MapFetcher {
        fn new(pages: &[(&str, u16, &str)]) -> Arc<Self> {
            Arc::new(Self(
                pages
                    .iter()
                    .map(|(url, status, body)| (url.to_string(), (*status, body.to_string())))
                    .collect(),
            ))
        }
    }

    #[async_trait]
    impl Fetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchResponse> {
            let (status, body) = self
                .0
                .get(url)
                .cloned()
                .unwrap_or((404, String::new()));
            Ok(FetchResponse {
                status,
                body: body.into_bytes(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingMonitor {
        updated: Mutex<Vec<(i64, usize)>>,
        deleted: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl FeedMonitor for RecordingMonitor {
        async fn feed_updated(&self, feed: &Feed, articles: &[Article]) -> Result<()> {
            self.updated.lock().unwrap().push((feed.id, articles.len()));
            Ok(())
        }

        async fn feed_deleted(&self, feed: &Feed) -> Result<()> {
            self.deleted.lock().unwrap().push(feed.id);
            Ok(())
        }
    }

    struct Setup {
        manager: Arc<FeedManager>,
        store: Arc<SqliteStore>,
        monitor: Arc<RecordingMonitor>,
        listener: mpsc::Receiver<Event>,
    }

    async fn setup(fetcher: Arc<MapFetcher>) -> Setup {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.add_user(&User::new("alice")).unwrap();

        let bus = EventBus::spawn(CancellationToken::new());
        let listener = bus.listener().await.unwrap();
        let eventable = EventableStore::new(store.clone(), bus);

        let discovery = Discovery::new(fetcher.clone(), None).unwrap();
        let mut manager =
            FeedManager::new(eventable, fetcher, discovery, Duration::from_secs(60));
        let monitor = Arc::new(RecordingMonitor::default());
        manager.add_feed_monitor(monitor.clone());

        Setup {
            manager: Arc::new(manager),
            store,
            monitor,
            listener,
        }
    }

    #[tokio::test]
    async fn test_add_feed_by_link_stores_articles() {
        let fetcher = MapFetcher::new(&[("https://example.com/feed.xml", 200, RSS)]);
        let mut s = setup(fetcher).await;

        let feed = s
            .manager
            .add_feed_for_user("https://example.com/feed.xml", Some("alice"))
            .await
            .unwrap();

        assert!(feed.id > 0);
        assert_eq!(feed.title, "Example");
        assert_eq!(s.store.get_feed_articles(feed.id).unwrap().len(), 2);
        assert_eq!(s.store.get_user_feeds("alice").unwrap().len(), 1);
        assert_eq!(*s.monitor.updated.lock().unwrap(), vec![(feed.id, 2)]);

        match s.listener.recv().await.unwrap() {
            Event::FeedUpdate { feed: f, articles } => {
                assert_eq!(f.id, feed.id);
                assert_eq!(articles.len(), 2);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_add_feed_follows_alternate_link() {
        let fetcher = MapFetcher::new(&[
            ("https://example.com/", 200, PAGE),
            ("https://example.com/feed.xml", 200, RSS),
        ]);
        let s = setup(fetcher).await;

        let feed = s
            .manager
            .add_feed_by_link("https://example.com/")
            .await
            .unwrap();
        assert_eq!(feed.link, "https://example.com/feed.xml");
    }

    #[tokio::test]
    async fn test_add_existing_feed_attaches_user() {
        let fetcher = MapFetcher::new(&[("https://example.com/feed.xml", 200, RSS)]);
        let s = setup(fetcher).await;

        let first = s
            .manager
            .add_feed_by_link("https://example.com/feed.xml")
            .await
            .unwrap();
        let second = s
            .manager
            .add_feed_for_user("https://example.com/feed.xml", Some("alice"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(s.store.get_all_feeds().unwrap().len(), 1);
        assert_eq!(s.store.count_feed_users(first.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_add_feed_without_feed_is_invalid() {
        let fetcher = MapFetcher::new(&[("https://example.com/", 200, "<html></html>")]);
        let s = setup(fetcher).await;

        let err = s
            .manager
            .add_feed_by_link("https://example.com/")
            .await
            .unwrap_err();
        assert!(matches!(err, EstuaryError::InvalidFeed(_)));

        let err = s
            .manager
            .add_feed_by_link("https://example.com/missing")
            .await
            .unwrap_err();
        assert!(matches!(err, EstuaryError::InvalidFeed(_)));
        assert!(s.store.get_all_feeds().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_error_recorded() {
        let fetcher = MapFetcher::new(&[("https://example.com/broken.xml", 500, "")]);
        let s = setup(fetcher).await;
        let feed_id = s
            .store
            .add_feed(&Feed::new("https://example.com/broken.xml".into()))
            .unwrap();

        let token = CancellationToken::new();
        s.manager.start(token.clone()).await.unwrap();

        let mut update_error = String::new();
        for _ in 0..50 {
            update_error = s.store.get_feed(feed_id).unwrap().unwrap().update_error;
            if !update_error.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(update_error, "HTTP Status: 500");
        assert_eq!(s.manager.scheduler().scheduled().await.unwrap(), vec![feed_id]);
        token.cancel();
    }

    #[tokio::test]
    async fn test_remove_feed() {
        let fetcher = MapFetcher::new(&[("https://example.com/feed.xml", 200, RSS)]);
        let s = setup(fetcher).await;
        let token = CancellationToken::new();
        s.manager.start(token.clone()).await.unwrap();

        let feed = s
            .manager
            .add_feed_by_link("https://example.com/feed.xml")
            .await
            .unwrap();
        s.manager.remove_feed(&feed).await.unwrap();

        assert!(s.store.get_feed(feed.id).unwrap().is_none());
        assert_eq!(*s.monitor.deleted.lock().unwrap(), vec![feed.id]);
        assert!(s.manager.scheduler().scheduled().await.unwrap().is_empty());
        token.cancel();
    }

    #[tokio::test]
    async fn test_discover_feeds_does_not_store() {
        let fetcher = MapFetcher::new(&[
            ("https://example.com/", 200, PAGE),
            ("https://example.com/feed.xml", 200, RSS),
        ]);
        let s = setup(fetcher).await;

        let feeds = s.manager.discover_feeds("https://example.com/").await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].title, "Example");
        assert_eq!(feeds[0].id, 0);
        assert!(s.store.get_all_feeds().unwrap().is_empty());
    }
}
