use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::error::{EstuaryError, Result};
use crate::config::{self, Config};
use crate::event::EventBus;
use crate::fetcher::http_fetcher::HttpFetcher;
use crate::hubbub::Hubbub;
use crate::manager::{Discovery, FeedManager, HttpSearchEngine, SearchEngine};
use crate::monitor::{
    spawn_monitor, DescriptionThumbnails, IndexMonitor, Monitor, ThumbnailMonitor, UnreadMonitor,
    UserFiltersMonitor,
};
use crate::processor::{
    ArticleProcessor, CleanupHtml, ParserProcessor, ProxyHttp, RelativeUrl, Unescape,
};
use crate::search::{MemoryIndex, SearchProvider};
use crate::store::sqlite::SqliteStore;
use crate::store::EventableStore;
use crate::stream::Streamer;

/// Every component of a running instance, wired from the configuration.
pub struct AppContext {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub fetcher: Arc<HttpFetcher>,
    pub bus: EventBus,
    pub manager: Arc<FeedManager>,
    pub search: Arc<dyn SearchProvider>,
    pub streamer: Streamer,
    monitors: Vec<Arc<dyn Monitor>>,
    unread: Option<Arc<UnreadMonitor>>,
    attached: AtomicBool,
    monitor_tasks: Mutex<Vec<JoinHandle<()>>>,
    token: CancellationToken,
}

impl AppContext {
    /// Open the configured database. Must be called inside a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        let db_path = config.database.resolved_path()?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Arc::new(SqliteStore::new(&db_path)?);
        Self::with_store(config, store)
    }

    pub fn in_memory(config: Config) -> Result<Self> {
        Self::with_store(config, Arc::new(SqliteStore::in_memory()?))
    }

    fn with_store(config: Config, store: Arc<SqliteStore>) -> Result<Self> {
        config.validate()?;

        let fetcher = Arc::new(HttpFetcher::with_options(
            config.fetcher.timeout,
            &config.fetcher.user_agent,
        )?);

        let token = CancellationToken::new();
        let bus = EventBus::spawn(token.clone());
        let eventable = EventableStore::new(store.clone(), bus.clone());

        let search_engine: Option<Arc<dyn SearchEngine>> =
            if config.discovery.search_url.trim().is_empty() {
                None
            } else {
                Some(Arc::new(HttpSearchEngine::new(
                    fetcher.clone(),
                    &config.discovery.search_url,
                )?))
            };
        let discovery = Discovery::new(fetcher.clone(), search_engine)?;

        let mut manager = FeedManager::new(
            eventable,
            fetcher.clone(),
            discovery,
            config.feed_manager.update_interval,
        );

        for name in &config.feed_manager.processors {
            manager.add_parser_processor(parser_processor(name)?);
        }
        for name in &config.feed_manager.article_processors {
            manager.add_article_processor(article_processor(name, &config)?);
        }

        if config.hubbub.enabled() {
            let (hubbub, updates) = Hubbub::new(
                store.clone(),
                fetcher.client().clone(),
                config.hubbub.clone(),
                token.child_token(),
            );
            manager.set_hubbub(hubbub, updates);
        }

        let search: Arc<dyn SearchProvider> = match config.content.search.provider.as_str() {
            "memory" => Arc::new(MemoryIndex::new()),
            other => {
                return Err(EstuaryError::Config(format!(
                    "unknown search provider '{}'",
                    other
                )))
            }
        };

        let mut monitors: Vec<Arc<dyn Monitor>> = Vec::new();
        let mut unread = None;
        for name in &config.feed_manager.monitors {
            match name.as_str() {
                config::MONITOR_INDEX => monitors.push(Arc::new(IndexMonitor::new(
                    search.clone(),
                    config.content.search.batch_size,
                ))),
                config::MONITOR_THUMBNAILER => {
                    let generator = Arc::new(DescriptionThumbnails::new()?);
                    monitors.push(Arc::new(ThumbnailMonitor::with_workers(
                        store.clone(),
                        generator,
                        config.content.thumbnailer.workers,
                    )));
                }
                config::MONITOR_UNREAD => {
                    let monitor = Arc::new(UnreadMonitor::new(
                        store.clone(),
                        config.content.unread.retention,
                        config.content.unread.gc_interval,
                    ));
                    unread = Some(monitor.clone());
                    monitors.push(monitor);
                }
                config::MONITOR_USER_FILTERS => {
                    monitors.push(Arc::new(UserFiltersMonitor::new(store.clone())))
                }
                other => {
                    return Err(EstuaryError::Config(format!("unknown monitor '{}'", other)))
                }
            }
        }

        let streamer = Streamer::new(bus.clone(), config.stream.keepalive);

        Ok(Self {
            config,
            store,
            fetcher,
            bus,
            manager: Arc::new(manager),
            search,
            streamer,
            monitors,
            unread,
            attached: AtomicBool::new(false),
            monitor_tasks: Mutex::new(Vec::new()),
            token,
        })
    }

    /// Root cancellation scope; cancelling it stops every task.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Subscribe the configured monitors to the bus. Later calls do nothing.
    ///
    /// One-shot commands call this before mutating the store and
    /// [`drain`](Self::drain) before exiting.
    pub async fn attach_monitors(&self) -> Result<()> {
        if self.attached.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut handles = Vec::with_capacity(self.monitors.len());
        for monitor in &self.monitors {
            let listener = self.bus.listener().await?;
            handles.push(spawn_monitor(
                monitor.clone(),
                listener,
                self.token.child_token(),
            ));
        }

        if let Ok(mut tasks) = self.monitor_tasks.lock() {
            tasks.extend(handles);
        }
        Ok(())
    }

    /// Close the bus and wait until every monitor has handled the events
    /// already dispatched to it. The context publishes no events afterwards.
    pub async fn drain(&self) {
        if let Err(e) = self.bus.close().await {
            debug!(error = %e, "Event bus already stopped");
        }

        let handles = match self.monitor_tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Monitor task ended abnormally");
            }
        }
    }

    /// Attach the monitors to the bus, then start scheduling feeds.
    pub async fn start(&self) -> Result<()> {
        self.attach_monitors().await?;

        if let Some(unread) = &self.unread {
            unread.clone().spawn_gc(self.token.child_token());
        }

        self.manager.start(self.token.clone()).await?;
        info!(monitors = self.monitors.len(), "Estuary started");
        Ok(())
    }

    pub fn shutdown(&self) {
        if self.token.is_cancelled() {
            warn!("Shutdown requested twice");
            return;
        }
        self.token.cancel();
    }
}

fn parser_processor(name: &str) -> Result<Box<dyn ParserProcessor>> {
    match name {
        config::PROCESSOR_RELATIVE_URL => Ok(Box::new(RelativeUrl::new()?)),
        config::PROCESSOR_UNESCAPE => Ok(Box::new(Unescape)),
        config::PROCESSOR_CLEANUP_HTML => Ok(Box::new(CleanupHtml::new()?)),
        other => Err(EstuaryError::Config(format!(
            "unknown parser processor '{}'",
            other
        ))),
    }
}

fn article_processor(name: &str, config: &Config) -> Result<Box<dyn ArticleProcessor>> {
    match name {
        config::PROCESSOR_PROXY_HTTP => Ok(Box::new(ProxyHttp::new(
            &config.feed_manager.proxy_http_template,
        )?)),
        other => Err(EstuaryError::Config(format!(
            "unknown article processor '{}'",
            other
        ))),
    }
}
