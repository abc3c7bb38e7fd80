use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::app::{EstuaryError, Result};
use crate::event::{Event, LISTENER_BUFFER};

/// Control messages. Subscriptions and dispatches share this one channel so
/// they are applied in the order they were issued.
enum BusOp {
    Subscribe(oneshot::Sender<mpsc::Receiver<Event>>),
    Dispatch {
        event: Event,
        done: oneshot::Sender<()>,
    },
    Close(oneshot::Sender<()>),
}

/// Handle to the event bus actor.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<BusOp>,
}

impl EventBus {
    /// Spawn the bus control loop. It stops when `token` is cancelled or all
    /// handles are dropped; listeners then observe their channel closing.
    pub fn spawn(token: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);

        tokio::spawn(async move {
            run(rx, token).await;
        });

        Self { tx }
    }

    /// Deliver `event` to every current listener. Resolves once each listener
    /// channel has accepted it.
    pub async fn dispatch(&self, event: Event) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();

        self.tx
            .send(BusOp::Dispatch {
                event,
                done: done_tx,
            })
            .await
            .map_err(|_| EstuaryError::ChannelClosed("event bus"))?;

        done_rx
            .await
            .map_err(|_| EstuaryError::ChannelClosed("event bus"))
    }

    /// Stop the bus after the operations queued before this one. Listeners
    /// keep the events already buffered and then see their channel close.
    pub async fn close(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();

        self.tx
            .send(BusOp::Close(done_tx))
            .await
            .map_err(|_| EstuaryError::ChannelClosed("event bus"))?;

        done_rx
            .await
            .map_err(|_| EstuaryError::ChannelClosed("event bus"))
    }

    /// Register a new listener receiving every event dispatched after it.
    pub async fn listener(&self) -> Result<mpsc::Receiver<Event>> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(BusOp::Subscribe(reply_tx))
            .await
            .map_err(|_| EstuaryError::ChannelClosed("event bus"))?;

        reply_rx
            .await
            .map_err(|_| EstuaryError::ChannelClosed("event bus"))
    }
}

async fn run(mut rx: mpsc::Receiver<BusOp>, token: CancellationToken) {
    info!("Event bus started");
    let mut listeners: Vec<mpsc::Sender<Event>> = Vec::new();

    loop {
        let op = tokio::select! {
            _ = token.cancelled() => break,
            op = rx.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        match op {
            BusOp::Subscribe(reply) => {
                let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
                listeners.push(tx);
                let _ = reply.send(rx);
            }
            BusOp::Dispatch { event, done } => {
                let name = event.name();
                let mut kept = Vec::with_capacity(listeners.len());

                for listener in std::mem::take(&mut listeners) {
                    let sent = tokio::select! {
                        _ = token.cancelled() => {
                            info!("Event bus stopped during dispatch");
                            return;
                        }
                        sent = listener.send(event.clone()) => sent.is_ok(),
                    };

                    if sent {
                        kept.push(listener);
                    } else {
                        debug!(event = %name, "Dropping closed listener");
                    }
                }

                listeners = kept;
                debug!(event = %name, listeners = listeners.len(), "Event dispatched");
                let _ = done.send(());
            }
            BusOp::Close(done) => {
                listeners.clear();
                let _ = done.send(());
                break;
            }
        }
    }

    info!("Event bus stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Feed;
    use std::time::Duration;

    fn delete_event(id: i64) -> Event {
        let mut feed = Feed::new(format!("https://example.com/{}.xml", id));
        feed.id = id;
        Event::FeedDelete { feed }
    }

    fn feed_id(event: &Event) -> i64 {
        match event {
            Event::FeedDelete { feed } => feed.id,
            _ => panic!("unexpected event"),
        }
    }

    #[tokio::test]
    async fn test_listeners_receive_in_dispatch_order() {
        let bus = EventBus::spawn(CancellationToken::new());
        let mut first = bus.listener().await.unwrap();
        let mut second = bus.listener().await.unwrap();

        for id in 1..=5 {
            bus.dispatch(delete_event(id)).await.unwrap();
        }

        for listener in [&mut first, &mut second] {
            for id in 1..=5 {
                let event = listener.recv().await.unwrap();
                assert_eq!(feed_id(&event), id);
            }
        }
    }

    #[tokio::test]
    async fn test_listener_only_sees_later_events() {
        let bus = EventBus::spawn(CancellationToken::new());
        let mut early = bus.listener().await.unwrap();
        bus.dispatch(delete_event(1)).await.unwrap();

        let mut late = bus.listener().await.unwrap();
        bus.dispatch(delete_event(2)).await.unwrap();

        assert_eq!(feed_id(&early.recv().await.unwrap()), 1);
        assert_eq!(feed_id(&late.recv().await.unwrap()), 2);
    }

    #[tokio::test]
    async fn test_slow_listener_backpressures_dispatch() {
        let bus = EventBus::spawn(CancellationToken::new());
        let mut slow = bus.listener().await.unwrap();

        for id in 0..LISTENER_BUFFER as i64 {
            bus.dispatch(delete_event(id)).await.unwrap();
        }

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            bus.dispatch(delete_event(99)),
        )
        .await;
        assert!(blocked.is_err());

        assert_eq!(feed_id(&slow.recv().await.unwrap()), 0);
    }

    #[tokio::test]
    async fn test_dropped_listener_is_removed() {
        let bus = EventBus::spawn(CancellationToken::new());
        let dropped = bus.listener().await.unwrap();
        let mut kept = bus.listener().await.unwrap();
        drop(dropped);

        bus.dispatch(delete_event(1)).await.unwrap();
        assert_eq!(feed_id(&kept.recv().await.unwrap()), 1);
    }

    #[tokio::test]
    async fn test_close_keeps_buffered_events() {
        let bus = EventBus::spawn(CancellationToken::new());
        let mut listener = bus.listener().await.unwrap();

        bus.dispatch(delete_event(1)).await.unwrap();
        bus.dispatch(delete_event(2)).await.unwrap();
        bus.close().await.unwrap();

        assert_eq!(feed_id(&listener.recv().await.unwrap()), 1);
        assert_eq!(feed_id(&listener.recv().await.unwrap()), 2);
        assert!(listener.recv().await.is_none());
        assert!(bus.dispatch(delete_event(3)).await.is_err());
    }

    #[tokio::test]
    async fn test_cancellation_closes_listeners() {
        let token = CancellationToken::new();
        let bus = EventBus::spawn(token.clone());
        let mut listener = bus.listener().await.unwrap();

        token.cancel();
        let closed = tokio::time::timeout(Duration::from_secs(1), listener.recv()).await;
        assert!(matches!(closed, Ok(None)));
        assert!(bus.dispatch(delete_event(1)).await.is_err());
    }
}
