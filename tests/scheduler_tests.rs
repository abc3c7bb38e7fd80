use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use estuary::app::Result;
use estuary::domain::Feed;
use estuary::fetcher::{FetchResponse, Fetcher, HttpFetcher};
use estuary::scheduler::Scheduler;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Test Feed</title>
    <link>http://example.com/</link>
    <item><title>Item 1</title><link>http://example.com/1</link><guid>1</guid></item>
  </channel>
</rss>"#;

/// Counts calls and the peak number of concurrent fetches.
struct MockFetcher {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockFetcher {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, _url: &str) -> Result<FetchResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        // A fresh body every time so every cycle emits.
        let body = RSS.replace("Item 1", &format!("Item {}", self.calls.load(Ordering::SeqCst)));
        Ok(FetchResponse {
            status: 200,
            body: body.into_bytes(),
        })
    }
}

fn feed(id: i64, link: &str) -> Feed {
    let mut feed = Feed::new(link.to_string());
    feed.id = id;
    feed
}

#[tokio::test(start_paused = true)]
async fn at_most_one_request_in_flight_per_feed() {
    let fetcher = MockFetcher::new(Duration::from_secs(5));
    let scheduler = Scheduler::new(fetcher.clone());
    let token = CancellationToken::new();
    scheduler.start(token.clone());

    let interval = Duration::from_secs(1);
    let mut first = scheduler
        .schedule_feed(&token, feed(1, "https://example.com/feed"), interval)
        .await;
    let mut second = scheduler
        .schedule_feed(&token, feed(1, "https://example.com/feed"), interval)
        .await;

    assert!(second.recv().await.is_none());

    for _ in 0..5 {
        assert!(first.recv().await.unwrap().result.is_ok());
    }
    assert_eq!(fetcher.peak.load(Ordering::SeqCst), 1);
    token.cancel();
}

#[tokio::test]
async fn unchanged_body_emits_single_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/rss+xml")
                .set_body_string(RSS),
        )
        .mount(&server)
        .await;

    let scheduler = Scheduler::new(Arc::new(HttpFetcher::new().unwrap()));
    let token = CancellationToken::new();
    scheduler.start(token.clone());

    let mut rx = scheduler
        .schedule_feed(
            &token,
            feed(1, &format!("{}/feed", server.uri())),
            Duration::from_millis(100),
        )
        .await;

    let update = rx.recv().await.unwrap();
    assert_eq!(update.result.unwrap().articles.len(), 1);

    let next = tokio::time::timeout(Duration::from_millis(450), rx.recv()).await;
    assert!(next.is_err(), "unchanged body must not be emitted again");

    let requests = server.received_requests().await.unwrap();
    assert!(requests.len() >= 2);
    token.cancel();
}

#[tokio::test]
async fn http_status_becomes_error_payload() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let scheduler = Scheduler::new(Arc::new(HttpFetcher::new().unwrap()));
    let token = CancellationToken::new();
    scheduler.start(token.clone());

    let mut rx = scheduler
        .schedule_feed(
            &token,
            feed(1, &format!("{}/feed", server.uri())),
            Duration::from_secs(60),
        )
        .await;

    let update = rx.recv().await.unwrap();
    assert_eq!(update.result.unwrap_err(), "HTTP Status: 500");
    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn no_request_inside_skip_window() {
    let fetcher = MockFetcher::new(Duration::ZERO);
    let scheduler = Scheduler::new(fetcher.clone());
    let token = CancellationToken::new();
    scheduler.start(token.clone());

    let mut skipping = feed(1, "https://example.com/feed");
    skipping.skip_hours = (0..24).collect();

    let mut rx = scheduler
        .schedule_feed(&token, skipping, Duration::from_secs(60))
        .await;

    // The first poll ignores skip windows.
    rx.recv().await.unwrap();
    tokio::time::sleep(Duration::from_secs(600)).await;

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    assert!(rx.try_recv().is_err());
    token.cancel();
}

#[tokio::test(start_paused = true)]
async fn cancellation_closes_every_stream() {
    let fetcher = MockFetcher::new(Duration::ZERO);
    let scheduler = Scheduler::new(fetcher.clone());
    let token = CancellationToken::new();
    scheduler.start(token.clone());

    let interval = Duration::from_secs(60);
    let mut streams = Vec::new();
    for id in 1..=3 {
        let mut rx = scheduler
            .schedule_feed(&token, feed(id, &format!("https://example.com/{}", id)), interval)
            .await;
        rx.recv().await.unwrap();
        streams.push(rx);
    }

    token.cancel();

    for mut rx in streams {
        let closed = tokio::time::timeout(interval + Duration::from_secs(1), async move {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "feed loop outlived cancellation");
    }
}
