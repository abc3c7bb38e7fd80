use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc, Weekday};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use rusqlite_migration::{Migrations, M};

use crate::app::{EstuaryError, Result};
use crate::domain::{
    Article, ArticleField, ArticleScope, Feed, Subscription, Tag, Thumbnail, User, UserProfile,
};
use crate::store::Store;

const FEED_COLUMNS: &str = "id, link, site_link, title, description, hub_link, ttl_secs, \
     skip_hours, skip_days, update_error, subscribe_error, created_at";
const ARTICLE_COLUMNS: &str = "id, feed_id, guid, link, title, description, date";
const SUBSCRIPTION_COLUMNS: &str =
    "feed_id, hub_link, secret, lease_duration, verification_time, subscription_failure";

/// Leases written by older releases were nanoseconds.
const LEGACY_LEASE_MIGRATION: &str = "UPDATE hubbub_subscriptions \
     SET lease_duration = lease_duration / 1000000000 \
     WHERE lease_duration >= 1000000000";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let migrations = Migrations::new(vec![M::up(include_str!(
            "../../migrations/001-initial/up.sql"
        ))]);

        let mut conn = self.conn()?;

        conn.execute("PRAGMA foreign_keys = ON", [])?;
        migrations
            .to_latest(&mut conn)
            .map_err(|e| EstuaryError::Other(format!("Database migration failed: {}", e)))?;

        let migrated = conn.execute(LEGACY_LEASE_MIGRATION, [])?;
        if migrated > 0 {
            tracing::info!(count = migrated, "Migrated subscription leases to seconds");
        }

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| {
            EstuaryError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(1),
                Some(e.to_string()),
            ))
        })
    }

    fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<DateTime<Utc>>().ok())
    }

    /// Fixed-width UTC timestamps so that stored dates compare lexically.
    fn format_datetime(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    fn feed_from_row(row: &Row) -> rusqlite::Result<Feed> {
        Ok(Feed {
            id: row.get(0)?,
            link: row.get(1)?,
            site_link: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            hub_link: row.get(5)?,
            ttl: row
                .get::<_, Option<i64>>(6)?
                .map(|secs| Duration::from_secs(secs.max(0) as u64)),
            skip_hours: Self::split_hours(&row.get::<_, String>(7)?),
            skip_days: Self::split_days(&row.get::<_, String>(8)?),
            update_error: row.get(9)?,
            subscribe_error: row.get(10)?,
            created_at: row
                .get::<_, String>(11)
                .ok()
                .and_then(|s| Self::parse_datetime(&s))
                .unwrap_or_else(Utc::now),
        })
    }

    fn article_from_row(row: &Row) -> rusqlite::Result<Article> {
        Ok(Article {
            id: row.get(0)?,
            feed_id: row.get(1)?,
            guid: row.get(2)?,
            link: row.get(3)?,
            title: row.get(4)?,
            description: row.get(5)?,
            date: row
                .get::<_, String>(6)
                .ok()
                .and_then(|s| Self::parse_datetime(&s))
                .unwrap_or_else(Utc::now),
        })
    }

    fn user_from_row(row: &Row) -> rusqlite::Result<User> {
        let profile: String = row.get(3)?;
        let profile: UserProfile = serde_json::from_str(&profile)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

        Ok(User {
            login: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            profile,
        })
    }

    fn subscription_from_row(row: &Row) -> rusqlite::Result<Subscription> {
        Ok(Subscription {
            feed_id: row.get(0)?,
            hub_link: row.get(1)?,
            secret: row.get(2)?,
            lease: Subscription::lease_from_stored(row.get(3)?),
            verification_time: row
                .get::<_, Option<String>>(4)?
                .and_then(|s| Self::parse_datetime(&s)),
            failure: row.get::<_, i32>(5)? != 0,
        })
    }

    fn join_hours(hours: &BTreeSet<u32>) -> String {
        hours
            .iter()
            .map(|h| h.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn split_hours(s: &str) -> BTreeSet<u32> {
        s.split(',')
            .filter_map(|h| h.trim().parse::<u32>().ok())
            .filter(|h| *h < 24)
            .collect()
    }

    fn split_days(s: &str) -> HashSet<Weekday> {
        s.split(',')
            .filter_map(|d| d.trim().parse::<Weekday>().ok())
            .collect()
    }

    fn placeholders(start: usize, count: usize) -> String {
        (start..start + count)
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// SQL selecting the ids of the user's articles within `scope`. `?1` is
    /// the user login; scope values are appended to `values`.
    fn scoped_article_ids(scope: &ArticleScope, values: &mut Vec<Value>) -> String {
        let base = "SELECT id FROM articles \
                    WHERE feed_id IN (SELECT feed_id FROM user_feeds WHERE user_login = ?1)";

        let ids = match scope {
            ArticleScope::All => return base.to_string(),
            ArticleScope::Ids(ids) | ArticleScope::Feeds(ids) => ids,
        };
        if ids.is_empty() {
            return format!("{} AND 0 = 1", base);
        }

        let column = match scope {
            ArticleScope::Feeds(_) => "feed_id",
            _ => "id",
        };
        let list = Self::placeholders(values.len() + 1, ids.len());
        values.extend(ids.iter().map(|id| Value::Integer(*id)));

        format!("{} AND {} IN ({})", base, column, list)
    }
}

impl Store for SqliteStore {
    fn add_feed(&self, feed: &Feed) -> Result<i64> {
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO feeds (link, site_link, title, description, hub_link, ttl_secs,
                                skip_hours, skip_days, update_error, subscribe_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                feed.link,
                feed.site_link,
                feed.title,
                feed.description,
                feed.hub_link,
                feed.ttl.map(|t| t.as_secs() as i64),
                Self::join_hours(&feed.skip_hours),
                feed.skip_day_names().join(","),
                feed.update_error,
                feed.subscribe_error,
                Self::format_datetime(&feed.created_at)
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    fn get_feed(&self, id: i64) -> Result<Option<Feed>> {
        let conn = self.conn()?;

        let result = conn
            .query_row(
                &format!("SELECT {} FROM feeds WHERE id = ?1", FEED_COLUMNS),
                params![id],
                Self::feed_from_row,
            )
            .optional()?;

        Ok(result)
    }

    fn get_feed_by_link(&self, link: &str) -> Result<Option<Feed>> {
        let conn = self.conn()?;

        let result = conn
            .query_row(
                &format!("SELECT {} FROM feeds WHERE link = ?1", FEED_COLUMNS),
                params![link],
                Self::feed_from_row,
            )
            .optional()?;

        Ok(result)
    }

    fn get_all_feeds(&self) -> Result<Vec<Feed>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM feeds ORDER BY title, link",
            FEED_COLUMNS
        ))?;

        let feeds = stmt
            .query_map([], Self::feed_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(feeds)
    }

    fn get_user_feeds(&self, login: &str) -> Result<Vec<Feed>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM feeds
             WHERE id IN (SELECT feed_id FROM user_feeds WHERE user_login = ?1)
             ORDER BY title, link",
            FEED_COLUMNS
        ))?;

        let feeds = stmt
            .query_map(params![login], Self::feed_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(feeds)
    }

    fn update_feed(&self, feed: &Feed) -> Result<()> {
        let conn = self.conn()?;

        let updated = conn.execute(
            "UPDATE feeds SET site_link = ?1, title = ?2, description = ?3, hub_link = ?4,
                              ttl_secs = ?5, skip_hours = ?6, skip_days = ?7,
                              update_error = ?8, subscribe_error = ?9
             WHERE id = ?10",
            params![
                feed.site_link,
                feed.title,
                feed.description,
                feed.hub_link,
                feed.ttl.map(|t| t.as_secs() as i64),
                Self::join_hours(&feed.skip_hours),
                feed.skip_day_names().join(","),
                feed.update_error,
                feed.subscribe_error,
                feed.id
            ],
        )?;

        if updated == 0 {
            return Err(EstuaryError::FeedNotFound(feed.id.to_string()));
        }
        Ok(())
    }

    fn update_feed_articles(&self, feed_id: i64, articles: &[Article]) -> Result<Vec<Article>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = Vec::new();

        for article in articles {
            let existing: Option<(i64, String, String)> = match article.guid.as_deref() {
                Some(guid) => tx
                    .query_row(
                        "SELECT id, title, description FROM articles
                         WHERE feed_id = ?1 AND guid = ?2",
                        params![feed_id, guid],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?,
                None => tx
                    .query_row(
                        "SELECT id, title, description FROM articles
                         WHERE feed_id = ?1 AND guid IS NULL AND link = ?2",
                        params![feed_id, article.link],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?,
            };

            match existing {
                Some((id, title, description)) => {
                    if title != article.title || description != article.description {
                        tx.execute(
                            "UPDATE articles SET title = ?1, description = ?2 WHERE id = ?3",
                            params![article.title, article.description, id],
                        )?;
                    }
                }
                None => {
                    tx.execute(
                        "INSERT INTO articles (feed_id, guid, link, title, description, date)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            feed_id,
                            article.guid,
                            article.link,
                            article.title,
                            article.description,
                            Self::format_datetime(&article.date)
                        ],
                    )?;

                    let mut stored = article.clone();
                    stored.id = tx.last_insert_rowid();
                    stored.feed_id = feed_id;
                    inserted.push(stored);
                }
            }
        }

        tx.commit()?;
        Ok(inserted)
    }

    fn delete_feed(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;

        conn.execute("DELETE FROM feeds WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn attach_feed(&self, login: &str, feed_id: i64) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "INSERT OR IGNORE INTO user_feeds (user_login, feed_id) VALUES (?1, ?2)",
            params![login, feed_id],
        )?;
        Ok(())
    }

    fn detach_feed(&self, login: &str, feed_id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM feed_tags WHERE user_login = ?1 AND feed_id = ?2",
            params![login, feed_id],
        )?;
        tx.execute(
            "DELETE FROM user_feeds WHERE user_login = ?1 AND feed_id = ?2",
            params![login, feed_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn count_feed_users(&self, feed_id: i64) -> Result<i64> {
        let conn = self.conn()?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM user_feeds WHERE feed_id = ?1",
            params![feed_id],
            |row| row.get(0),
        )?;

        Ok(count)
    }

    fn get_or_create_tag(&self, owner: &str, value: &str) -> Result<Tag> {
        let tag = Tag::new(owner, value)?;
        let conn = self.conn()?;

        conn.execute(
            "INSERT OR IGNORE INTO tags (owner, value) VALUES (?1, ?2)",
            params![tag.owner, tag.value],
        )?;
        let id: i64 = conn.query_row(
            "SELECT id FROM tags WHERE owner = ?1 AND value = ?2",
            params![tag.owner, tag.value],
            |row| row.get(0),
        )?;

        Ok(Tag { id, ..tag })
    }

    fn set_feed_tags(&self, login: &str, feed_id: i64, values: &[String]) -> Result<Vec<Tag>> {
        let tags = values
            .iter()
            .map(|v| Tag::new(login, v))
            .collect::<Result<Vec<_>>>()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM feed_tags WHERE user_login = ?1 AND feed_id = ?2",
            params![login, feed_id],
        )?;

        let mut stored = Vec::with_capacity(tags.len());
        for tag in tags {
            tx.execute(
                "INSERT OR IGNORE INTO tags (owner, value) VALUES (?1, ?2)",
                params![tag.owner, tag.value],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM tags WHERE owner = ?1 AND value = ?2",
                params![tag.owner, tag.value],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO feed_tags (user_login, feed_id, tag_id) VALUES (?1, ?2, ?3)",
                params![login, feed_id, id],
            )?;
            if !stored.iter().any(|t: &Tag| t.id == id) {
                stored.push(Tag { id, ..tag });
            }
        }

        tx.commit()?;
        Ok(stored)
    }

    fn get_feed_tags(&self, login: &str, feed_id: i64) -> Result<Vec<Tag>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT t.id, t.owner, t.value FROM tags t
             JOIN feed_tags ft ON ft.tag_id = t.id
             WHERE ft.user_login = ?1 AND ft.feed_id = ?2
             ORDER BY t.value",
        )?;

        let tags = stmt
            .query_map(params![login, feed_id], |row| {
                Ok(Tag {
                    id: row.get(0)?,
                    owner: row.get(1)?,
                    value: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(tags)
    }

    fn get_tag_feed_ids(&self, login: &str, tag_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT feed_id FROM feed_tags WHERE user_login = ?1 AND tag_id = ?2 ORDER BY feed_id",
        )?;

        let ids = stmt
            .query_map(params![login, tag_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    fn get_article(&self, id: i64) -> Result<Option<Article>> {
        let conn = self.conn()?;

        let result = conn
            .query_row(
                &format!("SELECT {} FROM articles WHERE id = ?1", ARTICLE_COLUMNS),
                params![id],
                Self::article_from_row,
            )
            .optional()?;

        Ok(result)
    }

    fn get_feed_articles(&self, feed_id: i64) -> Result<Vec<Article>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM articles WHERE feed_id = ?1 ORDER BY date DESC, id DESC",
            ARTICLE_COLUMNS
        ))?;

        let articles = stmt
            .query_map(params![feed_id], Self::article_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(articles)
    }

    fn set_article_state(
        &self,
        login: &str,
        field: ArticleField,
        value: bool,
        scope: &ArticleScope,
    ) -> Result<()> {
        let mut values = vec![Value::Text(login.to_string())];
        let ids = Self::scoped_article_ids(scope, &mut values);

        let sql = match (field, value) {
            (ArticleField::Read, true) => format!(
                "DELETE FROM unread_articles WHERE user_login = ?1 AND article_id IN ({})",
                ids
            ),
            (ArticleField::Read, false) => format!(
                "INSERT OR IGNORE INTO unread_articles (user_login, article_id, insert_date)
                 SELECT ?1, id, date FROM articles WHERE id IN ({})",
                ids
            ),
            (ArticleField::Favor, true) => format!(
                "INSERT OR IGNORE INTO favorite_articles (user_login, article_id)
                 SELECT ?1, id FROM articles WHERE id IN ({})",
                ids
            ),
            (ArticleField::Favor, false) => format!(
                "DELETE FROM favorite_articles WHERE user_login = ?1 AND article_id IN ({})",
                ids
            ),
        };

        let conn = self.conn()?;
        conn.execute(&sql, params_from_iter(values.iter()))?;
        Ok(())
    }

    fn get_unread_ids(&self, login: &str) -> Result<Vec<i64>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT article_id FROM unread_articles WHERE user_login = ?1 ORDER BY article_id",
        )?;

        let ids = stmt
            .query_map(params![login], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    fn get_favorite_ids(&self, login: &str) -> Result<Vec<i64>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(
            "SELECT article_id FROM favorite_articles WHERE user_login = ?1 ORDER BY article_id",
        )?;

        let ids = stmt
            .query_map(params![login], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    fn delete_stale_unread(&self, before: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn()?;

        let deleted = conn.execute(
            "DELETE FROM unread_articles WHERE insert_date < ?1",
            params![Self::format_datetime(&before)],
        )?;

        Ok(deleted)
    }

    fn add_user(&self, user: &User) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO users (login, name, email, profile) VALUES (?1, ?2, ?3, ?4)",
            params![
                user.login,
                user.name,
                user.email,
                serde_json::to_string(&user.profile)?
            ],
        )?;
        Ok(())
    }

    fn get_user(&self, login: &str) -> Result<Option<User>> {
        let conn = self.conn()?;

        let result = conn
            .query_row(
                "SELECT login, name, email, profile FROM users WHERE login = ?1",
                params![login],
                Self::user_from_row,
            )
            .optional()?;

        Ok(result)
    }

    fn get_all_users(&self) -> Result<Vec<User>> {
        let conn = self.conn()?;

        let mut stmt =
            conn.prepare("SELECT login, name, email, profile FROM users ORDER BY login")?;

        let users = stmt
            .query_map([], Self::user_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(users)
    }

    fn update_user(&self, user: &User) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "UPDATE users SET name = ?1, email = ?2, profile = ?3 WHERE login = ?4",
            params![
                user.name,
                user.email,
                serde_json::to_string(&user.profile)?,
                user.login
            ],
        )?;
        Ok(())
    }

    fn get_subscription(&self, feed_id: i64) -> Result<Option<Subscription>> {
        let conn = self.conn()?;

        let result = conn
            .query_row(
                &format!(
                    "SELECT {} FROM hubbub_subscriptions WHERE feed_id = ?1",
                    SUBSCRIPTION_COLUMNS
                ),
                params![feed_id],
                Self::subscription_from_row,
            )
            .optional()?;

        Ok(result)
    }

    fn get_all_subscriptions(&self) -> Result<Vec<Subscription>> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM hubbub_subscriptions ORDER BY feed_id",
            SUBSCRIPTION_COLUMNS
        ))?;

        let subscriptions = stmt
            .query_map([], Self::subscription_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(subscriptions)
    }

    fn update_subscription(&self, subscription: &Subscription) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO hubbub_subscriptions
                 (feed_id, hub_link, secret, lease_duration, verification_time,
                  subscription_failure)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(feed_id) DO UPDATE SET
                 hub_link = excluded.hub_link,
                 secret = excluded.secret,
                 lease_duration = excluded.lease_duration,
                 verification_time = excluded.verification_time,
                 subscription_failure = excluded.subscription_failure",
            params![
                subscription.feed_id,
                subscription.hub_link,
                subscription.secret,
                subscription.lease_secs(),
                subscription
                    .verification_time
                    .as_ref()
                    .map(Self::format_datetime),
                subscription.failure as i32
            ],
        )?;
        Ok(())
    }

    fn update_thumbnail(&self, thumbnail: &Thumbnail) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "INSERT INTO thumbnails (article_id, thumbnail, link, processed) VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(article_id) DO UPDATE SET
                 thumbnail = excluded.thumbnail, link = excluded.link, processed = 1",
            params![thumbnail.article_id, thumbnail.thumbnail, thumbnail.link],
        )?;
        Ok(())
    }

    fn get_thumbnail(&self, article_id: i64) -> Result<Option<Thumbnail>> {
        let conn = self.conn()?;

        let result = conn
            .query_row(
                "SELECT article_id, thumbnail, link FROM thumbnails WHERE article_id = ?1",
                params![article_id],
                |row| {
                    Ok(Thumbnail {
                        article_id: row.get(0)?,
                        thumbnail: row.get(1)?,
                        link: row.get(2)?,
                    })
                },
            )
            .optional()?;

        Ok(result)
    }
}
