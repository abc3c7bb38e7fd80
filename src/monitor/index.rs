use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::app::Result;
use crate::event::Event;
use crate::monitor::Monitor;
use crate::search::SearchProvider;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Keeps the search provider in step with stored articles.
pub struct IndexMonitor {
    provider: Arc<dyn SearchProvider>,
    batch_size: usize,
}

impl IndexMonitor {
    pub fn new(provider: Arc<dyn SearchProvider>, batch_size: usize) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl Monitor for IndexMonitor {
    fn name(&self) -> &'static str {
        "index"
    }

    async fn handle(&self, event: Event, _token: &CancellationToken) -> Result<()> {
        match event {
            Event::FeedUpdate { feed, articles } => {
                debug!(feed_id = feed.id, count = articles.len(), "Indexing articles");
                for batch in articles.chunks(self.batch_size) {
                    self.provider.batch_add(batch).await?;
                }
            }
            Event::FeedDelete { feed } => {
                debug!(feed_id = feed.id, "Removing feed from index");
                self.provider.delete_feed(feed.id).await?;
            }
            _ => {}
        }
        Ok(())
    }
}
