//! Per-feed polling loops.
//!
//! The scheduler keeps one loop per registered feed. All bookkeeping of the
//! registered loops happens inside a single control task; callers and feed
//! loops only enqueue closures for it to run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use md5::{Digest, Md5};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::{EstuaryError, Result};
use crate::domain::{Feed, ParsedFeed};
use crate::fetcher::Fetcher;
use crate::parser::parse_feed;

/// Capacity of each feed's output stream.
const UPDATE_BUFFER: usize = 1;

/// One output of a feed loop.
#[derive(Debug, Clone)]
pub struct UpdateData {
    pub feed: Feed,
    pub result: std::result::Result<ParsedFeed, String>,
}

struct Entry {
    token: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct Loops {
    entries: HashMap<i64, Entry>,
    next_generation: u64,
}

type ControlOp = Box<dyn FnOnce(&mut Loops) + Send>;

#[derive(Clone)]
pub struct Scheduler {
    fetcher: Arc<dyn Fetcher>,
    ops: mpsc::Sender<ControlOp>,
    pending: Arc<Mutex<Option<mpsc::Receiver<ControlOp>>>>,
}

impl Scheduler {
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        let (ops, rx) = mpsc::channel(100);
        Self {
            fetcher,
            ops,
            pending: Arc::new(Mutex::new(Some(rx))),
        }
    }

    /// Spawn the control loop. Cancelling `token` stops every feed loop.
    /// Calling it more than once has no effect.
    pub fn start(&self, token: CancellationToken) {
        let rx = match self.pending.lock() {
            Ok(mut pending) => pending.take(),
            Err(_) => None,
        };
        let Some(rx) = rx else {
            warn!("Scheduler already started");
            return;
        };

        tokio::spawn(async move {
            control_loop(rx, token).await;
        });
    }

    /// Register a polling loop for `feed` and return its output stream.
    ///
    /// The loop polls every `interval`, or every feed TTL when that is longer;
    /// the TTL is re-read after each refresh.
    ///
    /// The first registration wins. Scheduling a feed that already has a loop,
    /// one that was never stored, or one with a zero interval returns a stream
    /// that is already closed.
    pub async fn schedule_feed(
        &self,
        token: &CancellationToken,
        feed: Feed,
        interval: Duration,
    ) -> mpsc::Receiver<UpdateData> {
        let (tx, rx) = mpsc::channel(UPDATE_BUFFER);

        if feed.id <= 0 {
            warn!(url = %feed.link, "Refusing to schedule unknown feed");
            return rx;
        }
        if interval.is_zero() {
            warn!(feed_id = feed.id, "Refusing to schedule feed without a polling interval");
            return rx;
        }

        let feed_id = feed.id;
        let child = token.child_token();
        let loop_token = child.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let op: ControlOp = Box::new(move |loops: &mut Loops| {
            if loops.entries.contains_key(&feed_id) {
                let _ = reply_tx.send(None);
                return;
            }
            let generation = loops.next_generation;
            loops.next_generation += 1;
            loops.entries.insert(
                feed_id,
                Entry {
                    token: child,
                    generation,
                },
            );
            let _ = reply_tx.send(Some(generation));
        });

        let generation = match self.run_op(op, reply_rx).await {
            Ok(Some(generation)) => generation,
            Ok(None) => {
                debug!(feed_id, "Feed already scheduled");
                return rx;
            }
            Err(e) => {
                warn!(feed_id, error = %e, "Failed to schedule feed");
                return rx;
            }
        };

        info!(feed_id, url = %feed.link, interval_secs = interval.as_secs(), "Feed scheduled");

        let fetcher = Arc::clone(&self.fetcher);
        let ops = self.ops.clone();
        tokio::spawn(async move {
            poll_loop(fetcher.as_ref(), feed, interval, &loop_token, tx).await;
            unregister(&ops, feed_id, generation).await;
        });

        rx
    }

    /// Stop the loop of `feed_id`, if any. Its output stream closes.
    pub async fn unschedule(&self, feed_id: i64) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();

        let op: ControlOp = Box::new(move |loops: &mut Loops| {
            if let Some(entry) = loops.entries.remove(&feed_id) {
                entry.token.cancel();
            }
            let _ = reply_tx.send(());
        });

        self.run_op(op, reply_rx).await
    }

    /// Ids of the feeds that currently have a loop.
    pub async fn scheduled(&self) -> Result<Vec<i64>> {
        let (reply_tx, reply_rx) = oneshot::channel();

        let op: ControlOp = Box::new(move |loops: &mut Loops| {
            let mut ids: Vec<i64> = loops.entries.keys().copied().collect();
            ids.sort_unstable();
            let _ = reply_tx.send(ids);
        });

        self.run_op(op, reply_rx).await
    }

    async fn run_op<T>(&self, op: ControlOp, reply: oneshot::Receiver<T>) -> Result<T> {
        self.ops
            .send(op)
            .await
            .map_err(|_| EstuaryError::ChannelClosed("scheduler"))?;
        reply
            .await
            .map_err(|_| EstuaryError::ChannelClosed("scheduler"))
    }
}

async fn control_loop(mut rx: mpsc::Receiver<ControlOp>, token: CancellationToken) {
    info!("Scheduler started");
    let mut loops = Loops::default();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            op = rx.recv() => match op {
                Some(op) => op(&mut loops),
                None => break,
            },
        }
    }

    for (_, entry) in loops.entries.drain() {
        entry.token.cancel();
    }
    info!("Scheduler stopped");
}

/// Remove the entry of a finished loop, unless it was replaced meanwhile.
async fn unregister(ops: &mpsc::Sender<ControlOp>, feed_id: i64, generation: u64) {
    let op: ControlOp = Box::new(move |loops: &mut Loops| {
        if loops
            .entries
            .get(&feed_id)
            .is_some_and(|e| e.generation == generation)
        {
            loops.entries.remove(&feed_id);
        }
    });
    let _ = ops.send(op).await;
}

async fn poll_loop(
    fetcher: &dyn Fetcher,
    mut feed: Feed,
    base_interval: Duration,
    token: &CancellationToken,
    tx: mpsc::Sender<UpdateData>,
) {
    let mut content_hash: Option<String> = None;
    let mut first = true;

    loop {
        if token.is_cancelled() {
            break;
        }

        if !first && feed.in_skip_window(Utc::now()) {
            debug!(feed_id = feed.id, "Inside skip window, not polling");
        } else {
            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = poll_once(fetcher, &feed, &mut content_hash) => result,
            };

            if let Some(result) = result {
                if let Ok(parsed) = &result {
                    parsed.apply_to(&mut feed);
                }
                if token.is_cancelled() {
                    break;
                }

                let update = UpdateData {
                    feed: feed.clone(),
                    result,
                };
                let sent = tokio::select! {
                    _ = token.cancelled() => break,
                    sent = tx.send(update) => sent,
                };
                if sent.is_err() {
                    debug!(feed_id = feed.id, "Update stream dropped");
                    break;
                }
            }
        }
        first = false;

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(feed.poll_interval(base_interval)) => {}
        }
    }

    debug!(feed_id = feed.id, "Feed loop stopped");
}

/// Download and parse the feed. `None` means the body did not change.
async fn poll_once(
    fetcher: &dyn Fetcher,
    feed: &Feed,
    content_hash: &mut Option<String>,
) -> Option<std::result::Result<ParsedFeed, String>> {
    debug!(feed_id = feed.id, url = %feed.link, "Polling feed");

    let response = match fetcher.fetch(&feed.link).await {
        Ok(response) => response,
        Err(e) => return Some(Err(e.to_string())),
    };

    if !response.is_ok() {
        return Some(Err(format!("HTTP Status: {}", response.status)));
    }

    let digest = hex::encode(Md5::digest(&response.body));
    if content_hash.as_deref() == Some(digest.as_str()) {
        debug!(feed_id = feed.id, "Feed content unchanged");
        return None;
    }
    *content_hash = Some(digest);

    Some(parse_feed(&response.body).map_err(|e| e.to_string()))
}
