//! # Estuary
//!
//! The core of a multi-user feed aggregator: feeds are polled on their own
//! schedules (or pushed by WebSub hubs), new articles are stored once and
//! fanned out to background consumers and live client streams.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler ─┐
//!            ├─> FeedManager ─> EventableStore ─> EventBus ─┬─> Monitors
//! Hubbub ────┘                                              └─> Streamer
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! # Create a user and subscribe them to a feed
//! estuary user add alice
//! estuary add https://blog.rust-lang.org/feed.xml --user alice
//!
//! # Find feeds on a site
//! estuary discover https://blog.rust-lang.org/
//!
//! # Run the scheduler, hub subscriptions and monitors
//! estuary serve
//! ```

/// Application context and error handling.
///
/// The [`AppContext`](app::AppContext) struct wires together all components
/// from the configuration.
pub mod app;

/// Command-line interface using clap.
pub mod cli;

/// Configuration loaded from `~/.config/estuary/config.toml`.
pub mod config;

/// `serve` mode: PID file and signal handling.
pub mod daemon;

/// Core domain models.
///
/// - [`Feed`](domain::Feed), [`Article`](domain::Article), [`User`](domain::User)
/// - [`Subscription`](domain::Subscription): WebSub lease state
pub mod domain;

/// In-process publish/subscribe of repository mutations.
pub mod event;

/// HTTP fetching.
///
/// - [`Fetcher`](fetcher::Fetcher): Async trait for downloads
/// - [`HttpFetcher`](fetcher::HttpFetcher): reqwest-based implementation
pub mod fetcher;

/// WebSub subscriber: subscription requests, lease renewal and callbacks.
pub mod hubbub;

/// Feed lifecycle: adding, discovering, updating and removing feeds.
pub mod manager;

/// Background consumers of bus events.
pub mod monitor;

/// RSS 2.0, Atom and RSS 1.0 parsing into [`ParsedFeed`](domain::ParsedFeed).
pub mod parser;

/// Content rewriting applied to parsed feeds and served articles.
pub mod processor;

/// Per-feed polling loops.
pub mod scheduler;

/// Full-text search seam.
pub mod search;

/// SQLite persistence layer.
///
/// - [`Store`](store::Store): Trait defining storage operations
/// - [`SqliteStore`](store::SqliteStore): SQLite implementation
/// - [`EventableStore`](store::EventableStore): mutations that publish events
pub mod store;

/// Server-sent event streams for connected clients.
pub mod stream;
