use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub id: i64,
    /// Canonical feed URL, unique across the system.
    pub link: String,
    pub site_link: String,
    pub title: String,
    pub description: String,
    pub hub_link: Option<String>,
    /// Publisher supplied lower bound on the polling interval.
    pub ttl: Option<Duration>,
    /// Hours (UTC, 0-23) during which polling is suppressed.
    pub skip_hours: BTreeSet<u32>,
    /// Weekdays during which polling is suppressed.
    pub skip_days: HashSet<Weekday>,
    pub update_error: String,
    pub subscribe_error: String,
    pub created_at: DateTime<Utc>,
}

impl Feed {
    pub fn new(link: String) -> Self {
        Self {
            id: 0,
            link,
            site_link: String::new(),
            title: String::new(),
            description: String::new(),
            hub_link: None,
            ttl: None,
            skip_hours: BTreeSet::new(),
            skip_days: HashSet::new(),
            update_error: String::new(),
            subscribe_error: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.link
        } else {
            &self.title
        }
    }

    /// Whether `now` falls inside one of the feed's skip windows.
    pub fn in_skip_window(&self, now: DateTime<Utc>) -> bool {
        self.skip_hours.contains(&now.hour()) || self.skip_days.contains(&now.weekday())
    }

    /// Effective polling interval: the configured default, raised to the TTL when larger.
    pub fn poll_interval(&self, default: Duration) -> Duration {
        match self.ttl {
            Some(ttl) if ttl > default => ttl,
            _ => default,
        }
    }

    /// Skip days rendered as full weekday names, in calendar order.
    pub fn skip_day_names(&self) -> Vec<String> {
        let mut days: Vec<Weekday> = self.skip_days.iter().copied().collect();
        days.sort_by_key(|d| d.num_days_from_monday());
        days.into_iter().map(weekday_name).map(String::from).collect()
    }
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}
