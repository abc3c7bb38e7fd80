use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::app::{EstuaryError, Result};
use crate::domain::{article_ids, Article, ArticleField, ArticleScope};
use crate::event::Event;
use crate::monitor::Monitor;
use crate::store::Store;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 86400);
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(86400);

/// Marks new articles unread for every user and prunes old unread records.
pub struct UnreadMonitor {
    store: Arc<dyn Store>,
    retention: Duration,
    gc_interval: Duration,
}

impl UnreadMonitor {
    pub fn new(store: Arc<dyn Store>, retention: Duration, gc_interval: Duration) -> Self {
        Self {
            store,
            retention,
            gc_interval,
        }
    }

    fn mark_unread(&self, articles: &[Article]) -> Result<()> {
        for user in self.store.get_all_users()? {
            let visible: Vec<Article> = articles
                .iter()
                .filter(|a| !user.filters_out(a))
                .cloned()
                .collect();
            if visible.is_empty() {
                continue;
            }

            self.store.set_article_state(
                &user.login,
                ArticleField::Read,
                false,
                &ArticleScope::Ids(article_ids(&visible)),
            )?;
        }
        Ok(())
    }

    /// Delete unread records older than the retention window.
    pub fn collect_garbage(&self) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| EstuaryError::Config(format!("unread retention: {}", e)))?;
        let deleted = self.store.delete_stale_unread(Utc::now() - retention)?;
        info!(deleted, "Pruned stale unread records");
        Ok(deleted)
    }

    /// Run the periodic garbage collection until `token` is cancelled.
    pub fn spawn_gc(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.gc_interval;
            let mut ticker = tokio::time::interval_at(start, self.gc_interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.collect_garbage() {
                            error!(error = %e, "Unread garbage collection failed");
                        }
                    }
                }
            }
            debug!("Unread garbage collector stopped");
        })
    }
}

#[async_trait]
impl Monitor for UnreadMonitor {
    fn name(&self) -> &'static str {
        "unread"
    }

    async fn handle(&self, event: Event, _token: &CancellationToken) -> Result<()> {
        if let Event::FeedUpdate { articles, .. } = event {
            self.mark_unread(&articles)?;
        }
        Ok(())
    }
}
