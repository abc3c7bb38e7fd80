//! Server-sent event stream of feed updates for connected clients.
//!
//! The HTTP layer owns the socket; it hands the streamer an [`EventSink`]
//! wrapping the response body and awaits [`Streamer::connect`] for the
//! lifetime of the request.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app::Result;
use crate::domain::{article_ids, User};
use crate::event::{Event, EventBus};

pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(10);

/// Response headers the HTTP layer sets before streaming.
pub const SSE_HEADERS: [(&str, &str); 3] = [
    ("Content-Type", "text/event-stream"),
    ("Cache-Control", "no-cache"),
    ("Connection", "keep-alive"),
];

/// Writable side of a client connection.
#[async_trait]
pub trait EventSink: Send {
    async fn write(&mut self, chunk: &str) -> Result<()>;
    async fn flush(&mut self) -> Result<()>;
}

/// Checked before every write; `false` ends the connection.
pub trait TokenValidator: Send + Sync {
    fn validate(&self) -> bool;
}

impl<F> TokenValidator for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn validate(&self) -> bool {
        self()
    }
}

/// A client connection about to be streamed to.
pub struct Connection {
    pub remote_addr: String,
    pub user: User,
    pub feed_ids: HashSet<i64>,
    pub validator: Box<dyn TokenValidator>,
    /// Cancelled by the HTTP layer when the client goes away.
    pub done: CancellationToken,
}

#[derive(Serialize)]
struct FeedUpdatePayload {
    #[serde(rename = "feedID")]
    feed_id: i64,
    #[serde(rename = "articleIDs")]
    article_ids: Vec<i64>,
}

struct ConnectionRecord {
    id: u64,
    login: String,
    done: CancellationToken,
}

/// Why a stream ended without an error.
enum Closed {
    Cancelled,
    Invalid,
}

#[derive(Clone)]
pub struct Streamer {
    bus: EventBus,
    keepalive: Duration,
    connections: Arc<Mutex<HashMap<String, ConnectionRecord>>>,
    next_id: Arc<AtomicU64>,
}

impl Streamer {
    pub fn new(bus: EventBus, keepalive: Duration) -> Self {
        Self {
            bus,
            keepalive,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of live connections.
    pub fn connected(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Stream events to `sink` until the connection ends. Returns an error
    /// only when writing to the sink failed.
    pub async fn connect(
        &self,
        token: &CancellationToken,
        connection: Connection,
        sink: &mut dyn EventSink,
    ) -> Result<()> {
        let listener = self.bus.listener().await?;
        let remote_addr = connection.remote_addr.clone();
        let done = connection.done.clone();

        let id = self.register(&remote_addr, &connection.user.login, &done);
        info!(remote_addr = %remote_addr, user = %connection.user.login, "Stream connected");

        let result = self.stream(token, &connection, listener, sink).await;

        self.deregister(&remote_addr, id);
        match &result {
            Ok(Closed::Invalid) => {
                info!(remote_addr = %remote_addr, "Stream token no longer valid")
            }
            Ok(Closed::Cancelled) => info!(remote_addr = %remote_addr, "Stream closed"),
            Err(e) => debug!(remote_addr = %remote_addr, error = %e, "Stream write failed"),
        }

        result.map(|_| ())
    }

    fn register(&self, remote_addr: &str, login: &str, done: &CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut connections) = self.connections.lock() {
            let record = ConnectionRecord {
                id,
                login: login.to_string(),
                done: done.clone(),
            };
            if let Some(previous) = connections.insert(remote_addr.to_string(), record) {
                debug!(remote_addr, user = %previous.login, "Replacing stream connection");
                previous.done.cancel();
            }
        }
        id
    }

    fn deregister(&self, remote_addr: &str, id: u64) {
        if let Ok(mut connections) = self.connections.lock() {
            // A newer connection from the same address may have replaced this one.
            if connections.get(remote_addr).is_some_and(|r| r.id == id) {
                connections.remove(remote_addr);
            }
        }
    }

    async fn stream(
        &self,
        token: &CancellationToken,
        connection: &Connection,
        mut listener: tokio::sync::mpsc::Receiver<Event>,
        sink: &mut dyn EventSink,
    ) -> Result<Closed> {
        if !connection.validator.validate() {
            return Ok(Closed::Invalid);
        }
        sink.write("event: connection-established\ndata: {}\n\n").await?;
        sink.flush().await?;

        let start = tokio::time::Instant::now() + self.keepalive;
        let mut keepalive = tokio::time::interval_at(start, self.keepalive);

        loop {
            let chunk = tokio::select! {
                _ = token.cancelled() => return Ok(Closed::Cancelled),
                _ = connection.done.cancelled() => return Ok(Closed::Cancelled),
                _ = keepalive.tick() => ": ping\n\n".to_string(),
                event = listener.recv() => match event {
                    Some(Event::FeedUpdate { feed, articles })
                        if connection.feed_ids.contains(&feed.id) =>
                    {
                        let payload = FeedUpdatePayload {
                            feed_id: feed.id,
                            article_ids: article_ids(&articles),
                        };
                        let data = serde_json::to_string(&payload)?;
                        format!("event: feed-update\ndata: {}\n\n", data)
                    }
                    Some(_) => continue,
                    None => return Ok(Closed::Cancelled),
                },
            };

            if !connection.validator.validate() {
                return Ok(Closed::Invalid);
            }
            sink.write(&chunk).await?;
            sink.flush().await?;
        }
    }
}
