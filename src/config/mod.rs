//! Configuration management for Estuary.
//!
//! Configuration is read from `~/.config/estuary/config.toml` at startup.
//! If the file doesn't exist, a default configuration with comments is created.
//! Every section and key is optional; missing values fall back to defaults.

pub mod interval;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::hubbub::HubbubConfig;

pub const MONITOR_INDEX: &str = "index";
pub const MONITOR_THUMBNAILER: &str = "thumbnailer";
pub const MONITOR_UNREAD: &str = "unread";
pub const MONITOR_USER_FILTERS: &str = "user_filters";

pub const PROCESSOR_RELATIVE_URL: &str = "relative_url";
pub const PROCESSOR_UNESCAPE: &str = "unescape";
pub const PROCESSOR_CLEANUP_HTML: &str = "cleanup_html";
pub const PROCESSOR_PROXY_HTTP: &str = "proxy_http";

/// Main configuration struct.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub feed_manager: FeedManagerConfig,
    pub fetcher: FetcherConfig,
    pub hubbub: HubbubConfig,
    pub content: ContentConfig,
    pub discovery: DiscoveryConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Defaults to `<data dir>/estuary/estuary.db`.
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => {
                let data_dir = dirs::data_dir().ok_or(ConfigError::NoDataDir)?;
                Ok(data_dir.join("estuary").join("estuary.db"))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedManagerConfig {
    #[serde(deserialize_with = "interval::deserialize")]
    pub update_interval: Duration,
    pub monitors: Vec<String>,
    pub processors: Vec<String>,
    pub article_processors: Vec<String>,
    pub proxy_http_template: String,
}

impl Default for FeedManagerConfig {
    fn default() -> Self {
        Self {
            update_interval: Duration::from_secs(30 * 60),
            monitors: [
                MONITOR_INDEX,
                MONITOR_THUMBNAILER,
                MONITOR_UNREAD,
                MONITOR_USER_FILTERS,
            ]
            .map(String::from)
            .to_vec(),
            processors: [
                PROCESSOR_RELATIVE_URL,
                PROCESSOR_UNESCAPE,
                PROCESSOR_CLEANUP_HTML,
            ]
            .map(String::from)
            .to_vec(),
            article_processors: Vec::new(),
            proxy_http_template: "/proxy?url={url}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    #[serde(deserialize_with = "interval::deserialize")]
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: crate::fetcher::http_fetcher::DEFAULT_TIMEOUT,
            user_agent: crate::fetcher::http_fetcher::DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub search: SearchConfig,
    pub thumbnailer: ThumbnailerConfig,
    pub unread: UnreadConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub provider: String,
    pub batch_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            provider: "memory".to_string(),
            batch_size: crate::monitor::index::DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThumbnailerConfig {
    pub workers: usize,
}

impl Default for ThumbnailerConfig {
    fn default() -> Self {
        Self {
            workers: crate::monitor::thumbnailer::DEFAULT_WORKERS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UnreadConfig {
    #[serde(deserialize_with = "interval::deserialize")]
    pub retention: Duration,
    #[serde(deserialize_with = "interval::deserialize")]
    pub gc_interval: Duration,
}

impl Default for UnreadConfig {
    fn default() -> Self {
        Self {
            retention: crate::monitor::unread::DEFAULT_RETENTION,
            gc_interval: crate::monitor::unread::DEFAULT_GC_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Search page queried for non-URL discovery; `{query}` is replaced by
    /// the encoded query. Empty disables search discovery.
    pub search_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    #[serde(deserialize_with = "interval::deserialize")]
    pub keepalive: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive: crate::stream::DEFAULT_KEEPALIVE,
        }
    }
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, creates a default one with comments.
    /// If the config file exists but is invalid, returns an error.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_config(&config_path)?;
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path, which must exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Intervals and pool sizes must be positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("feed_manager.update_interval", self.feed_manager.update_interval),
            ("fetcher.timeout", self.fetcher.timeout),
            ("hubbub.retry_base", self.hubbub.retry_base),
            ("hubbub.retry_ceiling", self.hubbub.retry_ceiling),
            ("content.unread.gc_interval", self.content.unread.gc_interval),
            ("stream.keepalive", self.stream.keepalive),
        ];
        for (key, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }

        if self.content.search.batch_size == 0 {
            return Err(ConfigError::invalid(
                "content.search.batch_size",
                "must be at least 1",
            ));
        }
        if self.content.thumbnailer.workers == 0 {
            return Err(ConfigError::invalid(
                "content.thumbnailer.workers",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Get the default config file path: `~/.config/estuary/config.toml`
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("estuary").join("config.toml"))
    }

    fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut file = fs::File::create(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        file.write_all(Self::default_config_content().as_bytes())
            .map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;

        Ok(())
    }

    /// Generate the default config file content with comments.
    fn default_config_content() -> String {
        r##"# Estuary Configuration
#
# Intervals can be written as "90s", "30m", "1h", "1d" or a number of seconds.

[database]
# SQLite database file (defaults to the platform data directory)
# path = "/var/lib/estuary/estuary.db"

[feed_manager]
# Default polling interval; a feed's own TTL raises it
update_interval = "30m"

# Event consumers to run: index, thumbnailer, unread, user_filters
monitors = ["index", "thumbnailer", "unread", "user_filters"]

# Applied to every parsed feed, in order: relative_url, unescape, cleanup_html
processors = ["relative_url", "unescape", "cleanup_html"]

# Applied to articles served to clients: proxy_http
article_processors = []

# Where proxy_http routes plain http:// images; {url} is the encoded address
proxy_http_template = "/proxy?url={url}"

[fetcher]
timeout = "30s"
# user_agent = "estuary"

[hubbub]
# Public base URL hubs call back on; leave empty to disable WebSub
callback_url = ""

# Sent as the From header of subscription requests
from = ""

# Renew this long before a lease expires (at most half the lease)
lease_margin = "10m"

# Backoff for failed subscriptions
retry_base = "1m"
retry_ceiling = "6h"

[content.search]
provider = "memory"
batch_size = 100

[content.thumbnailer]
workers = 20

[content.unread]
# Unread records older than this are pruned
retention = "30d"
gc_interval = "24h"

[discovery]
# Search page used when discovering feeds from a non-URL query
# search_url = "https://html.duckduckgo.com/html/?q={query}"

[stream]
keepalive = "10s"
"##
        .to_string()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Could not determine data directory")]
    NoDataDir,

    #[error("Failed to read/write config file at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: &'static str },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: &'static str) -> Self {
        ConfigError::Invalid { key, reason }
    }
}

impl From<ConfigError> for crate::app::EstuaryError {
    fn from(e: ConfigError) -> Self {
        crate::app::EstuaryError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_deserializes() {
        let content = Config::default_config_content();
        let config: Config = toml::from_str(&content).expect("Default config should be valid TOML");

        assert_eq!(config.feed_manager.update_interval, Duration::from_secs(1800));
        assert_eq!(config.feed_manager.monitors.len(), 4);
        assert_eq!(config.hubbub.lease_margin, Duration::from_secs(600));
        assert_eq!(config.content.thumbnailer.workers, 20);
        assert_eq!(config.content.unread.retention, Duration::from_secs(30 * 86400));
        assert_eq!(config.stream.keepalive, Duration::from_secs(10));
        assert!(config.database.path.is_none());
    }

    #[test]
    fn test_partial_config() {
        let content = r##"
[feed_manager]
update_interval = "1h"

[content.unread]
gc_interval = 3600
"##;
        let config: Config = toml::from_str(content).expect("Partial config should work");

        assert_eq!(config.feed_manager.update_interval, Duration::from_secs(3600));
        assert_eq!(config.content.unread.gc_interval, Duration::from_secs(3600));
        // Defaults
        assert_eq!(config.content.unread.retention, Duration::from_secs(30 * 86400));
        assert_eq!(config.feed_manager.processors.len(), 3);
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").expect("Empty config should work");
        assert_eq!(config.fetcher.timeout, Duration::from_secs(30));
        assert!(config.hubbub.callback_url.is_empty());
    }

    #[test]
    fn test_invalid_interval_rejected() {
        let content = r##"
[stream]
keepalive = "soon"
"##;
        assert!(toml::from_str::<Config>(content).is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        for content in [
            "[stream]\nkeepalive = \"0s\"\n",
            "[content.unread]\ngc_interval = 0\n",
            "[feed_manager]\nupdate_interval = \"0m\"\n",
        ] {
            fs::write(&path, content).unwrap();
            assert!(
                matches!(Config::load_from(&path), Err(ConfigError::Invalid { .. })),
                "accepted {:?}",
                content
            );
        }
    }

    #[test]
    fn test_zero_pool_sizes_rejected() {
        let mut config = Config::default();
        config.content.thumbnailer.workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "content.thumbnailer.workers",
                ..
            })
        ));
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[database]\npath = \"/tmp/estuary-test.db\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(
            config.database.resolved_path().unwrap(),
            PathBuf::from("/tmp/estuary-test.db")
        );
    }
}
