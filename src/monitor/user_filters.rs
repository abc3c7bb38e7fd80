use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::app::Result;
use crate::domain::{Feed, Tag, User};
use crate::event::Event;
use crate::monitor::Monitor;
use crate::store::Store;

/// Keeps the feed lists of tag-bound user filters in step with the user's
/// feed tags. Filters left without feeds are deleted.
pub struct UserFiltersMonitor {
    store: Arc<dyn Store>,
}

impl UserFiltersMonitor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn reconcile(&self, feed: &Feed, user: &User, tags: &[Tag]) -> Result<()> {
        // The event carries a snapshot; the stored profile may be newer.
        let mut user = self
            .store
            .get_user(&user.login)?
            .unwrap_or_else(|| user.clone());

        let tag_ids: HashSet<i64> = tags.iter().map(|t| t.id).collect();
        let mut changed = false;

        user.profile.filters.retain_mut(|filter| {
            let Some(tag_id) = filter.tag_id else {
                return true;
            };
            let listed = filter.feed_ids.contains(&feed.id);

            if tag_ids.contains(&tag_id) && !listed {
                filter.feed_ids.push(feed.id);
                changed = true;
            } else if !tag_ids.contains(&tag_id) && listed {
                filter.feed_ids.retain(|id| *id != feed.id);
                changed = true;
                // A tag-bound filter covering no feed is invalid.
                if !filter.is_valid() {
                    debug!(tag_id, feed_id = feed.id, "Dropping filter without feeds");
                    return false;
                }
            }
            true
        });

        if changed {
            debug!(user = %user.login, feed_id = feed.id, "Updating user filters");
            self.store.update_user(&user)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Monitor for UserFiltersMonitor {
    fn name(&self) -> &'static str {
        "user_filters"
    }

    async fn handle(&self, event: Event, _token: &CancellationToken) -> Result<()> {
        if let Event::FeedSetTags { feed, user, tags } = event {
            self.reconcile(&feed, &user, &tags)?;
        }
        Ok(())
    }
}
