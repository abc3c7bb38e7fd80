use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stored lease values at or above this are nanoseconds written by older
/// releases. No real lease reaches 10^9 seconds.
const LEGACY_NANOS_THRESHOLD: i64 = 1_000_000_000;

/// WebSub subscription for a single feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub feed_id: i64,
    pub hub_link: String,
    /// Random path suffix the hub must call back on.
    pub secret: String,
    pub lease: Duration,
    pub verification_time: Option<DateTime<Utc>>,
    pub failure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Pending,
    Active,
    Failed,
}

impl Subscription {
    pub fn new(feed_id: i64, hub_link: String, secret: String) -> Self {
        Self {
            feed_id,
            hub_link,
            secret,
            lease: Duration::ZERO,
            verification_time: None,
            failure: false,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        if self.failure {
            SubscriptionState::Failed
        } else if self.verification_time.is_none() {
            SubscriptionState::Pending
        } else {
            SubscriptionState::Active
        }
    }

    /// When the lease should be renewed: `verification + lease - margin`,
    /// with the margin capped at half the lease.
    pub fn renew_at(&self, margin: Duration) -> Option<DateTime<Utc>> {
        let verified = self.verification_time?;
        let margin = margin.min(self.lease / 2);
        let until_renewal = self.lease.saturating_sub(margin);
        let until_renewal = chrono::Duration::from_std(until_renewal).ok()?;
        Some(verified + until_renewal)
    }

    /// End of the verified lease. Leases of zero never expire.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.lease.is_zero() {
            return None;
        }
        let verified = self.verification_time?;
        Some(verified + chrono::Duration::from_std(self.lease).ok()?)
    }

    pub fn lease_secs(&self) -> i64 {
        self.lease.as_secs() as i64
    }

    /// Decode a stored lease, accepting the legacy nanosecond encoding.
    pub fn lease_from_stored(raw: i64) -> Duration {
        if raw <= 0 {
            Duration::ZERO
        } else if raw >= LEGACY_NANOS_THRESHOLD {
            Duration::from_nanos(raw as u64)
        } else {
            Duration::from_secs(raw as u64)
        }
    }
}
