//! Unit tests for the notification broadcaster.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use agent_rpc::rpc::{EventBroadcaster, EventHandler, Notification, SUBSCRIBER_QUEUE};

fn event(method: &str, seq: u64) -> Notification {
    Notification {
        method: method.to_owned(),
        params: json!({ "seq": seq }),
    }
}

/// Handler that forwards every event into a channel.
fn collector() -> (EventHandler, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: EventHandler = Arc::new(move |event: &Notification| {
        let _ = tx.send(event.clone());
    });
    (handler, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event within 5s")
        .expect("channel open")
}

/// Every subscriber sees events in the order they were delivered.
#[tokio::test]
async fn delivery_preserves_order_per_subscriber() {
    let events = EventBroadcaster::new("test");
    let (first, mut first_rx) = collector();
    let (second, mut second_rx) = collector();
    events.subscribe(None, first).unwrap();
    events.subscribe(None, second).unwrap();

    for seq in 0..200 {
        assert_eq!(events.deliver(event("tick", seq)), 2);
    }

    for seq in 0..200 {
        assert_eq!(recv(&mut first_rx).await.params["seq"], seq);
        assert_eq!(recv(&mut second_rx).await.params["seq"], seq);
    }
}

/// A method filter only passes matching notifications.
#[tokio::test]
async fn method_filter_selects_notifications() {
    let events = EventBroadcaster::new("test");
    let (handler, mut rx) = collector();
    events
        .subscribe(Some("tool.start".into()), handler)
        .unwrap();

    assert_eq!(events.deliver(event("tool.end", 1)), 0);
    assert_eq!(events.deliver(event("tool.start", 2)), 1);

    let got = recv(&mut rx).await;
    assert_eq!(got.method, "tool.start");
    assert_eq!(got.params["seq"], 2);
}

/// After `unsubscribe` returns, later events are not delivered.
#[tokio::test]
async fn unsubscribed_handler_receives_nothing_new() {
    let events = EventBroadcaster::new("test");
    let (gone, mut gone_rx) = collector();
    let (stays, mut stays_rx) = collector();
    let id = events.subscribe(None, gone).unwrap();
    events.subscribe(None, stays).unwrap();

    events.deliver(event("a", 1));
    assert_eq!(recv(&mut gone_rx).await.params["seq"], 1);
    assert_eq!(recv(&mut stays_rx).await.params["seq"], 1);

    assert!(events.unsubscribe(id));
    assert!(!events.unsubscribe(id), "second unsubscribe must report false");

    assert_eq!(events.deliver(event("a", 2)), 1);
    assert_eq!(recv(&mut stays_rx).await.params["seq"], 2);
    assert!(
        gone_rx.recv().await.is_none(),
        "removed handler must be dropped without seeing event 2"
    );
}

/// A panicking handler neither stops other subscribers nor its own later
/// deliveries.
#[tokio::test]
async fn panicking_handler_is_isolated() {
    let events = EventBroadcaster::new("test");
    let (tx, mut flaky_rx) = mpsc::unbounded_channel();
    let flaky: EventHandler = Arc::new(move |event: &Notification| {
        assert!(event.params["seq"] != 1, "boom");
        let _ = tx.send(event.clone());
    });
    let (steady, mut steady_rx) = collector();
    events.subscribe(None, flaky).unwrap();
    events.subscribe(None, steady).unwrap();

    events.deliver(event("e", 1));
    events.deliver(event("e", 2));

    assert_eq!(recv(&mut steady_rx).await.params["seq"], 1);
    assert_eq!(recv(&mut steady_rx).await.params["seq"], 2);
    assert_eq!(
        recv(&mut flaky_rx).await.params["seq"],
        2,
        "handler must keep receiving after a panic"
    );
}

/// A subscriber that falls a full queue behind loses the overflow without
/// holding up delivery, keeps the events it already had in order, and
/// receives again once it catches up.
#[tokio::test]
async fn lagging_subscriber_drops_overflow_without_blocking() {
    let events = EventBroadcaster::new("test");
    let (lagging, mut lagging_rx) = collector();
    let (other, mut other_rx) = collector();
    events.subscribe(Some("tick".into()), lagging).unwrap();
    events.subscribe(Some("other".into()), other).unwrap();

    // The single-threaded test runtime cannot run the worker during this loop.
    let queued: usize = (0..SUBSCRIBER_QUEUE as u64 + 10)
        .map(|seq| events.deliver(event("tick", seq)))
        .sum();
    assert_eq!(queued, SUBSCRIBER_QUEUE, "overflow must be dropped, not queued");

    assert_eq!(events.deliver(event("other", 0)), 1, "other subscribers unaffected");
    assert_eq!(recv(&mut other_rx).await.method, "other");

    for seq in 0..SUBSCRIBER_QUEUE as u64 {
        assert_eq!(recv(&mut lagging_rx).await.params["seq"], seq);
    }

    assert_eq!(events.deliver(event("tick", 9_999)), 1);
    assert_eq!(recv(&mut lagging_rx).await.params["seq"], 9_999);
}

/// Closing drops every subscription.
#[tokio::test]
async fn close_releases_subscribers() {
    let events = EventBroadcaster::new("test");
    let (handler, mut rx) = collector();
    events.subscribe(None, handler).unwrap();

    events.close();

    assert!(events.is_empty());
    assert_eq!(events.deliver(event("late", 1)), 0);
    assert!(rx.recv().await.is_none(), "worker must exit once released");
}

/// Subscribing needs a runtime for the delivery worker.
#[test]
fn subscribe_outside_runtime_fails() {
    let events = EventBroadcaster::new("test");
    let (handler, _rx) = collector();

    assert!(events.subscribe(None, handler).is_err());
}
