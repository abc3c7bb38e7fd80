pub mod http_fetcher;

use async_trait::async_trait;

use crate::app::Result;

pub use http_fetcher::HttpFetcher;

/// Raw outcome of a GET. Non-200 statuses are returned, not raised.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Download `url`. Transport failures are errors; HTTP statuses are data.
    async fn fetch(&self, url: &str) -> Result<FetchResponse>;
}
