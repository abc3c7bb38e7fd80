use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use estuary::app::Result;
use estuary::domain::{
    Article, ArticleField, ArticleScope, Feed, Subscription, Tag, Thumbnail, User, UserFilter,
};
use estuary::event::{Event, EventBus};
use estuary::monitor::{spawn_monitor, Monitor, UnreadMonitor, UserFiltersMonitor};
use estuary::store::{EventableStore, SqliteStore, Store};
use tokio_util::sync::CancellationToken;

/// Counts profile writes on top of an in-memory store.
struct CountingStore {
    inner: SqliteStore,
    user_updates: AtomicUsize,
}

impl Store for CountingStore {
    fn add_feed(&self, feed: &Feed) -> Result<i64> {
        self.inner.add_feed(feed)
    }
    fn get_feed(&self, id: i64) -> Result<Option<Feed>> {
        self.inner.get_feed(id)
    }
    fn get_feed_by_link(&self, link: &str) -> Result<Option<Feed>> {
        self.inner.get_feed_by_link(link)
    }
    fn get_all_feeds(&self) -> Result<Vec<Feed>> {
        self.inner.get_all_feeds()
    }
    fn get_user_feeds(&self, login: &str) -> Result<Vec<Feed>> {
        self.inner.get_user_feeds(login)
    }
    fn update_feed(&self, feed: &Feed) -> Result<()> {
        self.inner.update_feed(feed)
    }
    fn update_feed_articles(&self, feed_id: i64, articles: &[Article]) -> Result<Vec<Article>> {
        self.inner.update_feed_articles(feed_id, articles)
    }
    fn delete_feed(&self, id: i64) -> Result<()> {
        self.inner.delete_feed(id)
    }
    fn attach_feed(&self, login: &str, feed_id: i64) -> Result<()> {
        self.inner.attach_feed(login, feed_id)
    }
    fn detach_feed(&self, login: &str, feed_id: i64) -> Result<()> {
        self.inner.detach_feed(login, feed_id)
    }
    fn count_feed_users(&self, feed_id: i64) -> Result<i64> {
        self.inner.count_feed_users(feed_id)
    }
    fn get_or_create_tag(&self, owner: &str, value: &str) -> Result<Tag> {
        self.inner.get_or_create_tag(owner, value)
    }
    fn set_feed_tags(&self, login: &str, feed_id: i64, values: &[String]) -> Result<Vec<Tag>> {
        self.inner.set_feed_tags(login, feed_id, values)
    }
    fn get_feed_tags(&self, login: &str, feed_id: i64) -> Result<Vec<Tag>> {
        self.inner.get_feed_tags(login, feed_id)
    }
    fn get_tag_feed_ids(&self, login: &str, tag_id: i64) -> Result<Vec<i64>> {
        self.inner.get_tag_feed_ids(login, tag_id)
    }
    fn get_article(&self, id: i64) -> Result<Option<Article>> {
        self.inner.get_article(id)
    }
    fn get_feed_articles(&self, feed_id: i64) -> Result<Vec<Article>> {
        self.inner.get_feed_articles(feed_id)
    }
    fn set_article_state(
        &self,
        login: &str,
        field: ArticleField,
        value: bool,
        scope: &ArticleScope,
    ) -> Result<()> {
        self.inner.set_article_state(login, field, value, scope)
    }
    fn get_unread_ids(&self, login: &str) -> Result<Vec<i64>> {
        self.inner.get_unread_ids(login)
    }
    fn get_favorite_ids(&self, login: &str) -> Result<Vec<i64>> {
        self.inner.get_favorite_ids(login)
    }
    fn delete_stale_unread(&self, before: DateTime<Utc>) -> Result<usize> {
        self.inner.delete_stale_unread(before)
    }
    fn add_user(&self, user: &User) -> Result<()> {
        self.inner.add_user(user)
    }
    fn get_user(&self, login: &str) -> Result<Option<User>> {
        self.inner.get_user(login)
    }
    fn get_all_users(&self) -> Result<Vec<User>> {
        self.inner.get_all_users()
    }
    fn update_user(&self, user: &User) -> Result<()> {
        self.user_updates.fetch_add(1, Ordering::SeqCst);
        self.inner.update_user(user)
    }
    fn get_subscription(&self, feed_id: i64) -> Result<Option<Subscription>> {
        self.inner.get_subscription(feed_id)
    }
    fn get_all_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.inner.get_all_subscriptions()
    }
    fn update_subscription(&self, subscription: &Subscription) -> Result<()> {
        self.inner.update_subscription(subscription)
    }
    fn update_thumbnail(&self, thumbnail: &Thumbnail) -> Result<()> {
        self.inner.update_thumbnail(thumbnail)
    }
    fn get_thumbnail(&self, article_id: i64) -> Result<Option<Thumbnail>> {
        self.inner.get_thumbnail(article_id)
    }
}

fn store_with_feed() -> (Arc<SqliteStore>, Feed) {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let mut feed = Feed::new("https://example.com/feed.xml".into());
    feed.id = store.add_feed(&feed).unwrap();
    store.add_user(&User::new("alice")).unwrap();
    store.attach_feed("alice", feed.id).unwrap();
    (store, feed)
}

fn article(guid: &str, age: chrono::Duration) -> Article {
    let mut a = Article::new(0, format!("https://example.com/{}", guid));
    a.guid = Some(guid.into());
    a.date = Utc::now() - age;
    a
}

#[tokio::test]
async fn listeners_receive_events_in_dispatch_order() {
    let token = CancellationToken::new();
    let bus = EventBus::spawn(token.clone());
    let mut first = bus.listener().await.unwrap();
    let mut second = bus.listener().await.unwrap();

    let feeds: Vec<Feed> = (1..=25)
        .map(|id| {
            let mut feed = Feed::new(format!("https://example.com/{}", id));
            feed.id = id;
            feed
        })
        .collect();

    let dispatcher = {
        let bus = bus.clone();
        let feeds = feeds.clone();
        tokio::spawn(async move {
            for feed in feeds {
                bus.dispatch(Event::FeedDelete { feed }).await.unwrap();
            }
        })
    };

    // Both listeners are drained together: a full buffer on one blocks the
    // bus for the other.
    for expected in 1..=25 {
        for listener in [&mut first, &mut second] {
            match listener.recv().await.unwrap() {
                Event::FeedDelete { feed } => assert_eq!(feed.id, expected),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    dispatcher.await.unwrap();
    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn stale_unread_records_pruned_on_tick() {
    let (store, feed) = store_with_feed();
    let inserted = store
        .update_feed_articles(
            feed.id,
            &[
                article("old", chrono::Duration::days(45)),
                article("new", chrono::Duration::days(1)),
            ],
        )
        .unwrap();
    let ids: Vec<i64> = inserted.iter().map(|a| a.id).collect();
    store
        .set_article_state("alice", ArticleField::Read, false, &ArticleScope::Ids(ids))
        .unwrap();
    assert_eq!(store.get_unread_ids("alice").unwrap().len(), 2);

    let monitor = Arc::new(UnreadMonitor::new(
        store.clone(),
        Duration::from_secs(30 * 86400),
        Duration::from_secs(86400),
    ));
    let token = CancellationToken::new();
    monitor.spawn_gc(token.clone());

    tokio::time::sleep(Duration::from_secs(86400 + 1)).await;

    let mut unread = Vec::new();
    for _ in 0..50 {
        unread = store.get_unread_ids("alice").unwrap();
        if unread.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let fresh = inserted.iter().find(|a| a.link.ends_with("/new")).unwrap();
    assert_eq!(unread, vec![fresh.id]);
    token.cancel();
}

#[tokio::test]
async fn removing_tag_reconciles_filters() {
    let (store, feed) = store_with_feed();
    let news = store.get_or_create_tag("alice", "news").unwrap();

    let mut user = store.get_user("alice").unwrap().unwrap();
    let filter = |feed_ids: Vec<i64>| UserFilter {
        tag_id: Some(news.id),
        feed_ids,
        term: "sponsored".into(),
        match_title: true,
        ..Default::default()
    };
    user.profile.filters = vec![filter(vec![feed.id, 99]), filter(vec![feed.id])];
    store.update_user(&user).unwrap();
    store
        .set_feed_tags("alice", feed.id, &["news".to_string()])
        .unwrap();

    let token = CancellationToken::new();
    let bus = EventBus::spawn(token.clone());
    spawn_monitor(
        Arc::new(UserFiltersMonitor::new(store.clone())),
        bus.listener().await.unwrap(),
        token.child_token(),
    );
    let eventable = EventableStore::new(store.clone(), bus);

    eventable
        .set_feed_tags(&user, &feed, &["tech".to_string()])
        .await
        .unwrap();

    let mut filters = Vec::new();
    for _ in 0..100 {
        filters = store.get_user("alice").unwrap().unwrap().profile.filters;
        if filters.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(filters.len(), 1);
    assert_eq!(filters[0].feed_ids, vec![99]);
    token.cancel();
}

#[tokio::test]
async fn filter_reconciliation_writes_profile_once() {
    let store = Arc::new(CountingStore {
        inner: SqliteStore::in_memory().unwrap(),
        user_updates: AtomicUsize::new(0),
    });
    let mut feed = Feed::new("https://example.com/feed.xml".into());
    feed.id = store.add_feed(&feed).unwrap();
    store.add_user(&User::new("alice")).unwrap();
    let news = store.get_or_create_tag("alice", "news").unwrap();
    let tech = store.get_or_create_tag("alice", "tech").unwrap();

    let mut user = store.get_user("alice").unwrap().unwrap();
    let filter = |feed_ids: Vec<i64>| UserFilter {
        tag_id: Some(news.id),
        feed_ids,
        term: "sponsored".into(),
        match_title: true,
        ..Default::default()
    };
    // One filter keeps another feed, the other loses its only one.
    user.profile.filters = vec![filter(vec![feed.id, 99]), filter(vec![feed.id])];
    store.update_user(&user).unwrap();
    store.user_updates.store(0, Ordering::SeqCst);

    let monitor = UserFiltersMonitor::new(store.clone());
    let token = CancellationToken::new();
    let set_tags = |tags: Vec<Tag>| Event::FeedSetTags {
        feed: feed.clone(),
        user: user.clone(),
        tags,
    };

    monitor.handle(set_tags(vec![tech.clone()]), &token).await.unwrap();
    assert_eq!(store.user_updates.load(Ordering::SeqCst), 1);
    let filters = store.get_user("alice").unwrap().unwrap().profile.filters;
    assert_eq!(filters.len(), 1);
    assert_eq!(filters[0].feed_ids, vec![99]);

    // Nothing left to change.
    monitor.handle(set_tags(vec![tech]), &token).await.unwrap();
    assert_eq!(store.user_updates.load(Ordering::SeqCst), 1);
}
