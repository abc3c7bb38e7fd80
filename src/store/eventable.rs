use std::sync::Arc;

use tracing::warn;

use crate::app::Result;
use crate::domain::{Article, ArticleField, ArticleScope, Feed, Tag, User};
use crate::event::{Event, EventBus};
use crate::store::Store;

/// Repository wrapper that publishes an event on the bus after every
/// successful mutation. Reads go straight to [`inner`](Self::inner).
#[derive(Clone)]
pub struct EventableStore {
    store: Arc<dyn Store>,
    bus: EventBus,
}

impl EventableStore {
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub fn inner(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Store the articles of `feed`, announcing the newly inserted ones.
    pub async fn update_feed_articles(
        &self,
        feed: &Feed,
        articles: &[Article],
    ) -> Result<Vec<Article>> {
        let inserted = self.store.update_feed_articles(feed.id, articles)?;

        if !inserted.is_empty() {
            self.publish(Event::FeedUpdate {
                feed: feed.clone(),
                articles: inserted.clone(),
            })
            .await;
        }

        Ok(inserted)
    }

    pub async fn delete_feed(&self, feed: &Feed) -> Result<()> {
        self.store.delete_feed(feed.id)?;
        self.publish(Event::FeedDelete { feed: feed.clone() }).await;
        Ok(())
    }

    pub async fn set_feed_tags(
        &self,
        user: &User,
        feed: &Feed,
        values: &[String],
    ) -> Result<Vec<Tag>> {
        let tags = self.store.set_feed_tags(&user.login, feed.id, values)?;

        self.publish(Event::FeedSetTags {
            feed: feed.clone(),
            user: user.clone(),
            tags: tags.clone(),
        })
        .await;

        Ok(tags)
    }

    pub async fn read(&self, user: &User, value: bool, scope: ArticleScope) -> Result<()> {
        self.set_state(user, ArticleField::Read, value, scope).await
    }

    pub async fn favor(&self, user: &User, value: bool, scope: ArticleScope) -> Result<()> {
        self.set_state(user, ArticleField::Favor, value, scope).await
    }

    async fn set_state(
        &self,
        user: &User,
        field: ArticleField,
        value: bool,
        scope: ArticleScope,
    ) -> Result<()> {
        self.store
            .set_article_state(&user.login, field, value, &scope)?;

        self.publish(Event::ArticleState {
            user: user.clone(),
            field,
            value,
            scope,
        })
        .await;

        Ok(())
    }

    /// The mutation already happened; a stopped bus only loses the event.
    async fn publish(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.bus.dispatch(event).await {
            warn!(event = %name, error = %e, "Failed to dispatch event");
        }
    }
}
