use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::domain::Subscription;
use crate::hubbub::Hubbub;
use crate::parser::parse_feed;
use crate::scheduler::UpdateData;

/// What the HTTP layer should answer to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackResponse {
    pub status: u16,
    pub body: String,
}

impl CallbackResponse {
    fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }
}

impl Hubbub {
    /// Handle a hub request on `/<feed id>/<secret>`.
    ///
    /// `params` are the request's query parameters and `body` its payload.
    /// Requests with a `hub.mode` are verifications or denials; anything
    /// else is a content push.
    pub async fn process_callback(
        self: &Arc<Self>,
        feed_id: &str,
        secret: &str,
        params: &HashMap<String, String>,
        body: &[u8],
    ) -> CallbackResponse {
        let Ok(feed_id) = feed_id.trim().parse::<i64>() else {
            debug!(feed_id, "Callback with malformed feed id");
            return CallbackResponse::status(400);
        };

        let mut subscription = match self.store.get_subscription(feed_id) {
            Ok(Some(subscription)) if subscription.secret == secret => subscription,
            Ok(_) => {
                debug!(feed_id, "Callback for unknown subscription");
                return CallbackResponse::status(404);
            }
            Err(e) => {
                error!(feed_id, error = %e, "Failed to load subscription");
                return CallbackResponse::status(500);
            }
        };

        let param = |name: &str| params.get(name).map(String::as_str);

        match param("hub.mode") {
            Some("subscribe") => {
                let Some(challenge) = param("hub.challenge") else {
                    return CallbackResponse::status(400);
                };
                let lease = match param("hub.lease_seconds").map(|s| s.trim().parse::<u64>()) {
                    Some(Ok(secs)) => Duration::from_secs(secs),
                    Some(Err(_)) => return CallbackResponse::status(400),
                    None => Duration::ZERO,
                };

                subscription.lease = lease;
                subscription.verification_time = Some(Utc::now());
                subscription.failure = false;
                if !self.save(&subscription) {
                    return CallbackResponse::status(500);
                }

                info!(feed_id, lease_secs = lease.as_secs(), "Subscription verified");
                self.schedule_renewal(&subscription);
                CallbackResponse::ok(challenge)
            }
            Some("unsubscribe") => {
                let Some(challenge) = param("hub.challenge") else {
                    return CallbackResponse::status(400);
                };

                subscription.failure = true;
                if !self.save(&subscription) {
                    return CallbackResponse::status(500);
                }

                info!(feed_id, "Unsubscription verified");
                self.cancel_timer(feed_id);
                CallbackResponse::ok(challenge)
            }
            Some("denied") => {
                subscription.failure = true;
                if !self.save(&subscription) {
                    return CallbackResponse::status(500);
                }

                warn!(
                    feed_id,
                    topic = param("hub.topic").unwrap_or_default(),
                    reason = param("hub.reason").unwrap_or_default(),
                    "Hub denied subscription"
                );
                self.schedule_retry(feed_id);
                CallbackResponse::ok("")
            }
            Some(mode) => {
                debug!(feed_id, mode, "Callback with unknown mode");
                CallbackResponse::status(400)
            }
            None => {
                self.push(feed_id, body).await;
                CallbackResponse::ok("")
            }
        }
    }

    fn save(&self, subscription: &Subscription) -> bool {
        match self.store.update_subscription(subscription) {
            Ok(()) => true,
            Err(e) => {
                error!(feed_id = subscription.feed_id, error = %e, "Failed to store subscription");
                false
            }
        }
    }

    /// Malformed pushes are dropped; the hub still gets a 200 so it does not
    /// retry them.
    async fn push(&self, feed_id: i64, body: &[u8]) {
        let parsed = match parse_feed(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(feed_id, error = %e, "Discarding unparseable hub push");
                return;
            }
        };

        let feed = match self.store.get_feed(feed_id) {
            Ok(Some(feed)) => feed,
            Ok(None) => {
                debug!(feed_id, "Hub push for deleted feed");
                return;
            }
            Err(e) => {
                error!(feed_id, error = %e, "Failed to load pushed feed");
                return;
            }
        };

        debug!(feed_id, articles = parsed.articles.len(), "Hub push received");
        let update = UpdateData {
            feed,
            result: Ok(parsed),
        };
        if self.updates.send(update).await.is_err() {
            warn!(feed_id, "Feed manager is not accepting hub updates");
        }
    }
}
