//! Search provider seam used by the index monitor.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::app::{EstuaryError, Result};
use crate::domain::Article;

#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Index a batch of articles.
    async fn batch_add(&self, articles: &[Article]) -> Result<()>;
    /// Drop every document that belongs to the feed.
    async fn delete_feed(&self, feed_id: i64) -> Result<()>;
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<i64>>;
}

/// In-process index keeping lowercase title and description per article.
#[derive(Default)]
pub struct MemoryIndex {
    documents: RwLock<HashMap<i64, Document>>,
}

struct Document {
    feed_id: i64,
    text: String,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> EstuaryError {
        EstuaryError::Other("search index lock poisoned".into())
    }
}

#[async_trait]
impl SearchProvider for MemoryIndex {
    async fn batch_add(&self, articles: &[Article]) -> Result<()> {
        let mut documents = self.documents.write().map_err(|_| Self::poisoned())?;

        for article in articles {
            documents.insert(
                article.id,
                Document {
                    feed_id: article.feed_id,
                    text: format!("{}\n{}", article.title, article.description).to_lowercase(),
                },
            );
        }
        Ok(())
    }

    async fn delete_feed(&self, feed_id: i64) -> Result<()> {
        let mut documents = self.documents.write().map_err(|_| Self::poisoned())?;
        documents.retain(|_, doc| doc.feed_id != feed_id);
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<i64>> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let documents = self.documents.read().map_err(|_| Self::poisoned())?;
        let mut hits: Vec<i64> = documents
            .iter()
            .filter(|(_, doc)| terms.iter().all(|t| doc.text.contains(t.as_str())))
            .map(|(id, _)| *id)
            .collect();
        hits.sort_unstable_by(|a, b| b.cmp(a));
        hits.truncate(limit);

        Ok(hits)
    }
}
