//! Event bus consumers.
//!
//! Each monitor runs in its own task, reading from a dedicated listener.
//! Events are handled one at a time, in the order they were dispatched.

pub mod index;
pub mod thumbnailer;
pub mod unread;
pub mod user_filters;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::app::Result;
use crate::event::Event;

pub use index::IndexMonitor;
pub use thumbnailer::{DescriptionThumbnails, ThumbnailGenerator, ThumbnailMonitor};
pub use unread::UnreadMonitor;
pub use user_filters::UserFiltersMonitor;

#[async_trait]
pub trait Monitor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Process one event. Errors are logged by the run loop and do not stop
    /// the monitor.
    async fn handle(&self, event: Event, token: &CancellationToken) -> Result<()>;
}

/// Drive `monitor` from `listener` until the listener closes or `token` is
/// cancelled.
pub fn spawn_monitor(
    monitor: Arc<dyn Monitor>,
    listener: mpsc::Receiver<Event>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(monitor.as_ref(), listener, &token).await;
    })
}

async fn run(
    monitor: &dyn Monitor,
    mut listener: mpsc::Receiver<Event>,
    token: &CancellationToken,
) {
    info!(monitor = monitor.name(), "Monitor started");

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = listener.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let name = event.name();
        debug!(monitor = monitor.name(), event = %name, "Handling event");
        if let Err(e) = monitor.handle(event, token).await {
            error!(monitor = monitor.name(), event = %name, error = %e, "Monitor failed");
        }
    }

    info!(monitor = monitor.name(), "Monitor stopped");
}
