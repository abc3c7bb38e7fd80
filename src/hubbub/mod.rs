//! WebSub (PubSubHubbub) subscriber.
//!
//! Subscriptions are requested from a feed's hub and verified by the hub
//! calling back on `<callback_url>/<feed id>/<secret>`. Verified leases are
//! renewed ahead of expiry; failed subscriptions are retried with exponential
//! backoff. Content pushed by the hub is parsed and handed to the feed manager
//! through the update channel returned by [`Hubbub::new`].

pub mod callback;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::{EstuaryError, Result};
use crate::config::interval;
use crate::domain::{Feed, Subscription, SubscriptionState};
use crate::scheduler::UpdateData;
use crate::store::Store;

pub use callback::CallbackResponse;

const UPDATE_BUFFER: usize = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubbubConfig {
    /// Public base URL of the callback endpoint. Empty disables WebSub.
    pub callback_url: String,
    /// Contact sent in the `From` header of hub requests.
    pub from: String,
    #[serde(deserialize_with = "interval::deserialize")]
    pub lease_margin: Duration,
    #[serde(deserialize_with = "interval::deserialize")]
    pub retry_base: Duration,
    #[serde(deserialize_with = "interval::deserialize")]
    pub retry_ceiling: Duration,
}

impl Default for HubbubConfig {
    fn default() -> Self {
        Self {
            callback_url: String::new(),
            from: String::new(),
            lease_margin: Duration::from_secs(10 * 60),
            retry_base: Duration::from_secs(60),
            retry_ceiling: Duration::from_secs(6 * 3600),
        }
    }
}

impl HubbubConfig {
    pub fn enabled(&self) -> bool {
        !self.callback_url.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerAction {
    /// Request (or renew) the subscription.
    Subscribe,
    /// Give up on an unverified request.
    Expire,
}

pub struct Hubbub {
    store: Arc<dyn Store>,
    client: Client,
    config: HubbubConfig,
    updates: mpsc::Sender<UpdateData>,
    token: CancellationToken,
    /// One pending renewal, retry or verification timer per feed.
    timers: Mutex<HashMap<i64, CancellationToken>>,
    /// Consecutive failures per feed, for backoff.
    attempts: Mutex<HashMap<i64, u32>>,
}

impl Hubbub {
    /// Create the engine and the stream of pushed feed updates.
    pub fn new(
        store: Arc<dyn Store>,
        client: Client,
        config: HubbubConfig,
        token: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<UpdateData>) {
        let (updates, rx) = mpsc::channel(UPDATE_BUFFER);

        let hubbub = Arc::new(Self {
            store,
            client,
            config,
            updates,
            token,
            timers: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
        });

        (hubbub, rx)
    }

    /// Schedule renewal or retry timers for every stored subscription.
    pub fn init_subscriptions(self: &Arc<Self>) -> Result<usize> {
        let subscriptions = self.store.get_all_subscriptions()?;
        let now = Utc::now();

        for subscription in &subscriptions {
            let delay = match subscription.state() {
                SubscriptionState::Active if subscription.lease.is_zero() => {
                    debug!(feed_id = subscription.feed_id, "Subscription has no lease to renew");
                    continue;
                }
                SubscriptionState::Active => subscription
                    .renew_at(self.config.lease_margin)
                    .and_then(|at| (at - now).to_std().ok())
                    .unwrap_or(Duration::ZERO),
                SubscriptionState::Pending => self.config.retry_base,
                SubscriptionState::Failed => self.retry_delay(subscription.feed_id),
            };

            debug!(
                feed_id = subscription.feed_id,
                delay_secs = delay.as_secs(),
                "Scheduling subscription renewal"
            );
            self.schedule(subscription.feed_id, delay);
        }

        info!(count = subscriptions.len(), "Hubbub subscriptions initialized");
        Ok(subscriptions.len())
    }

    /// Ask the feed's hub for a subscription. The stored record stays pending
    /// until the hub verifies it through the callback.
    pub async fn subscribe(self: &Arc<Self>, feed: &Feed) -> Result<()> {
        let hub = feed
            .hub_link
            .clone()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| EstuaryError::Subscription(format!("feed {} has no hub", feed.id)))?;

        let previous = self.store.get_subscription(feed.id)?;
        let secret = match &previous {
            Some(existing) if !existing.secret.is_empty() => existing.secret.clone(),
            _ => Uuid::new_v4().simple().to_string(),
        };

        let mut subscription = Subscription::new(feed.id, hub, secret);
        self.store.update_subscription(&subscription)?;

        if let Err(e) = self.request(&subscription, feed, "subscribe").await {
            warn!(feed_id = feed.id, error = %e, "Hub subscription request failed");
            subscription.failure = true;
            self.store.update_subscription(&subscription)?;
            self.schedule_retry(feed.id);
            return Err(e);
        }

        // The hub has until the old lease runs out to verify.
        let deadline = previous
            .as_ref()
            .and_then(Subscription::expires_at)
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO)
            .max(self.config.retry_base);
        self.arm(feed.id, deadline, TimerAction::Expire);

        info!(feed_id = feed.id, hub = %subscription.hub_link, "Subscription requested");
        Ok(())
    }

    /// Ask the hub to drop the feed's subscription. Feeds without one are
    /// left alone.
    pub async fn unsubscribe(&self, feed: &Feed) -> Result<()> {
        self.cancel_timer(feed.id);

        let Some(subscription) = self.store.get_subscription(feed.id)? else {
            return Ok(());
        };

        self.request(&subscription, feed, "unsubscribe").await?;
        info!(feed_id = feed.id, "Unsubscription requested");
        Ok(())
    }

    fn callback_for(&self, subscription: &Subscription) -> String {
        format!(
            "{}/{}/{}",
            self.config.callback_url.trim_end_matches('/'),
            subscription.feed_id,
            subscription.secret
        )
    }

    async fn request(&self, subscription: &Subscription, feed: &Feed, mode: &str) -> Result<()> {
        let callback = self.callback_for(subscription);
        let form = [
            ("hub.mode", mode),
            ("hub.topic", feed.link.as_str()),
            ("hub.callback", callback.as_str()),
        ];

        let mut request = self.client.post(&subscription.hub_link).form(&form);
        if !self.config.from.is_empty() {
            request = request.header(reqwest::header::FROM, &self.config.from);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EstuaryError::Subscription(format!(
                "hub returned HTTP status {}",
                status.as_u16()
            )));
        }
        Ok(())
    }

    fn retry_delay(&self, feed_id: i64) -> Duration {
        let attempt = self
            .attempts
            .lock()
            .map(|a| a.get(&feed_id).copied().unwrap_or(0))
            .unwrap_or(0);

        self.config
            .retry_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.config.retry_ceiling)
    }

    fn schedule_retry(self: &Arc<Self>, feed_id: i64) {
        let delay = self.retry_delay(feed_id);
        if let Ok(mut attempts) = self.attempts.lock() {
            *attempts.entry(feed_id).or_insert(0) += 1;
        }

        debug!(feed_id, delay_secs = delay.as_secs(), "Retrying subscription later");
        self.schedule(feed_id, delay);
    }

    fn schedule_renewal(self: &Arc<Self>, subscription: &Subscription) {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.remove(&subscription.feed_id);
        }

        if subscription.lease.is_zero() {
            return;
        }

        let delay = subscription
            .renew_at(self.config.lease_margin)
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);
        self.schedule(subscription.feed_id, delay);
    }

    /// Resubscribe the feed after `delay`, replacing any earlier timer.
    fn schedule(self: &Arc<Self>, feed_id: i64, delay: Duration) {
        self.arm(feed_id, delay, TimerAction::Subscribe);
    }

    /// Run `action` for the feed after `delay`, replacing any earlier timer.
    fn arm(self: &Arc<Self>, feed_id: i64, delay: Duration, action: TimerAction) {
        let timer = self.token.child_token();
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(previous) = timers.insert(feed_id, timer.clone()) {
                previous.cancel();
            }
        }

        let hubbub = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match action {
                TimerAction::Subscribe => hubbub.resubscribe(feed_id).await,
                TimerAction::Expire => hubbub.expire(feed_id),
            }
        });
    }

    async fn resubscribe(self: &Arc<Self>, feed_id: i64) {
        match self.store.get_feed(feed_id) {
            Ok(Some(feed)) => {
                // Failures reschedule themselves.
                let _ = self.subscribe(&feed).await;
            }
            Ok(None) => debug!(feed_id, "Feed gone, dropping subscription timer"),
            Err(e) => error!(feed_id, error = %e, "Failed to load feed for renewal"),
        }
    }

    /// Mark a request the hub never verified as failed and retry it.
    fn expire(self: &Arc<Self>, feed_id: i64) {
        let mut subscription = match self.store.get_subscription(feed_id) {
            Ok(Some(subscription)) if subscription.state() == SubscriptionState::Pending => {
                subscription
            }
            // Verified while the request was in flight; its renewal timer was
            // replaced by this one.
            Ok(Some(subscription)) if subscription.state() == SubscriptionState::Active => {
                self.schedule_renewal(&subscription);
                return;
            }
            Ok(_) => return,
            Err(e) => {
                error!(feed_id, error = %e, "Failed to load subscription");
                return;
            }
        };

        warn!(feed_id, hub = %subscription.hub_link, "Hub did not verify subscription in time");
        subscription.failure = true;
        if let Err(e) = self.store.update_subscription(&subscription) {
            error!(feed_id, error = %e, "Failed to store subscription");
            return;
        }
        self.schedule_retry(feed_id);
    }

    fn cancel_timer(&self, feed_id: i64) {
        if let Ok(mut timers) = self.timers.lock() {
            if let Some(timer) = timers.remove(&feed_id) {
                timer.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn hubbub(config: HubbubConfig) -> Arc<Hubbub> {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        Hubbub::new(store, Client::new(), config, CancellationToken::new()).0
    }

    #[test]
    fn test_config_enabled() {
        assert!(!HubbubConfig::default().enabled());
        let config = HubbubConfig {
            callback_url: "https://reader.example.com/hubbub".into(),
            ..Default::default()
        };
        assert!(config.enabled());
    }

    #[tokio::test]
    async fn test_retry_delay_backs_off_to_ceiling() {
        let hubbub = hubbub(HubbubConfig {
            retry_base: Duration::from_secs(60),
            retry_ceiling: Duration::from_secs(300),
            ..Default::default()
        });

        assert_eq!(hubbub.retry_delay(1), Duration::from_secs(60));
        hubbub.attempts.lock().unwrap().insert(1, 2);
        assert_eq!(hubbub.retry_delay(1), Duration::from_secs(240));
        hubbub.attempts.lock().unwrap().insert(1, 10);
        assert_eq!(hubbub.retry_delay(1), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_callback_url_layout() {
        let hubbub = hubbub(HubbubConfig {
            callback_url: "https://reader.example.com/hubbub/".into(),
            ..Default::default()
        });
        let subscription = Subscription::new(12, "https://hub.example.com".into(), "abc".into());
        assert_eq!(
            hubbub.callback_for(&subscription),
            "https://reader.example.com/hubbub/12/abc"
        );
    }

    #[tokio::test]
    async fn test_init_skips_leases_without_expiry() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let verified = |link: &str, lease_secs: u64| {
            let feed_id = store.add_feed(&Feed::new(link.into())).unwrap();
            let mut sub = Subscription::new(feed_id, "https://hub.example.com".into(), "s".into());
            sub.lease = Duration::from_secs(lease_secs);
            sub.verification_time = Some(Utc::now());
            store.update_subscription(&sub).unwrap();
            feed_id
        };
        let leased = verified("https://example.com/a.xml", 3600);
        let open_ended = verified("https://example.com/b.xml", 0);

        let token = CancellationToken::new();
        let (hubbub, _updates) =
            Hubbub::new(store, Client::new(), HubbubConfig::default(), token.clone());
        assert_eq!(hubbub.init_subscriptions().unwrap(), 2);

        let timers = hubbub.timers.lock().unwrap();
        assert!(timers.contains_key(&leased));
        assert!(!timers.contains_key(&open_ended));
        token.cancel();
    }

    #[tokio::test]
    async fn test_subscribe_requires_hub() {
        let hubbub = hubbub(HubbubConfig::default());
        let feed = Feed::new("https://example.com/feed.xml".into());
        assert!(matches!(
            hubbub.subscribe(&feed).await,
            Err(EstuaryError::Subscription(_))
        ));
    }
}
