use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::app::Result;
use crate::domain::{Article, Thumbnail};
use crate::event::Event;
use crate::monitor::Monitor;
use crate::store::Store;

pub const DEFAULT_WORKERS: usize = 20;

#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    /// Produce a thumbnail for the article, if it has a usable image.
    async fn generate(&self, article: &Article) -> Result<Option<Thumbnail>>;
}

/// Uses the first image embedded in the article description.
pub struct DescriptionThumbnails {
    image: Regex,
}

impl DescriptionThumbnails {
    pub fn new() -> Result<Self> {
        Ok(Self {
            image: Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#)?,
        })
    }
}

#[async_trait]
impl ThumbnailGenerator for DescriptionThumbnails {
    async fn generate(&self, article: &Article) -> Result<Option<Thumbnail>> {
        let Some(caps) = self.image.captures(&article.description) else {
            return Ok(None);
        };
        let src = caps[1].trim().to_string();

        Ok(Some(Thumbnail {
            article_id: article.id,
            thumbnail: src.clone(),
            link: src,
        }))
    }
}

/// Generates thumbnails for new articles on a bounded pool of workers.
pub struct ThumbnailMonitor {
    store: Arc<dyn Store>,
    generator: Arc<dyn ThumbnailGenerator>,
    semaphore: Arc<Semaphore>,
}

impl ThumbnailMonitor {
    pub fn new(store: Arc<dyn Store>, generator: Arc<dyn ThumbnailGenerator>) -> Self {
        Self::with_workers(store, generator, DEFAULT_WORKERS)
    }

    pub fn with_workers(
        store: Arc<dyn Store>,
        generator: Arc<dyn ThumbnailGenerator>,
        workers: usize,
    ) -> Self {
        Self {
            store,
            generator,
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    async fn process(&self, articles: Vec<Article>, token: &CancellationToken) {
        let mut handles = Vec::with_capacity(articles.len());

        for article in articles {
            let store = Arc::clone(&self.store);
            let generator = Arc::clone(&self.generator);
            let semaphore = Arc::clone(&self.semaphore);
            let token = token.clone();

            let handle = tokio::spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };

                let generated = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    generated = generator.generate(&article) => generated,
                };

                match generated {
                    Ok(Some(thumbnail)) => {
                        if let Err(e) = store.update_thumbnail(&thumbnail) {
                            error!(
                                article_id = article.id,
                                error = %e,
                                "Failed to store thumbnail"
                            );
                        }
                    }
                    Ok(None) => debug!(article_id = article.id, "No thumbnail candidate"),
                    Err(e) => {
                        warn!(article_id = article.id, error = %e, "Thumbnail generation failed")
                    }
                }
            });

            handles.push(handle);
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Thumbnail worker join error");
            }
        }
    }
}

#[async_trait]
impl Monitor for ThumbnailMonitor {
    fn name(&self) -> &'static str {
        "thumbnailer"
    }

    async fn handle(&self, event: Event, token: &CancellationToken) -> Result<()> {
        if let Event::FeedUpdate { articles, .. } = event {
            self.process(articles, token).await;
        }
        Ok(())
    }
}
