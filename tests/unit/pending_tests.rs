//! Unit tests for the request correlation table.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;

use agent_rpc::rpc::CorrelationTable;
use agent_rpc::RpcError;

/// Ids are unique and increase monotonically from 1.
#[test]
fn ids_are_unique_and_increasing() {
    let table = CorrelationTable::new();
    let mut slots = Vec::new();
    let mut ids = Vec::new();
    for _ in 0..5 {
        let (id, slot) = table.register("ping").unwrap();
        ids.push(id);
        slots.push(slot);
    }

    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(table.len(), 5);
}

/// Concurrent registrations from many threads never collide.
#[test]
fn concurrent_registration_never_collides() {
    let table = Arc::new(CorrelationTable::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                (0..100)
                    .map(|_| table.register("m").unwrap().0)
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id), "id {id} issued twice");
        }
    }
    assert_eq!(seen.len(), 800);
}

/// Resolving delivers the result once; a second completion is a no-op.
#[tokio::test]
async fn resolution_happens_exactly_once() {
    let table = CorrelationTable::new();
    let (id, slot) = table.register("ping").unwrap();

    assert!(table.resolve(id, json!({"ok": true})));
    assert!(!table.resolve(id, json!({"ok": false})), "second resolve must be ignored");
    assert!(!table.reject(id, RpcError::Transport("late".into())));

    let outcome = slot.await.unwrap().unwrap();
    assert_eq!(outcome, json!({"ok": true}));
    assert!(table.is_empty(), "resolved entry must be removed");
}

/// Responses for ids nobody registered are ignored.
#[test]
fn unknown_id_is_ignored() {
    let table = CorrelationTable::new();
    assert!(!table.resolve(404, json!(null)));
}

/// Each waiter gets its own result regardless of completion order.
#[tokio::test]
async fn completions_are_isolated_per_id() {
    let table = CorrelationTable::new();
    let (a, slot_a) = table.register("a").unwrap();
    let (b, slot_b) = table.register("b").unwrap();

    table.resolve(b, json!("for b"));
    table.resolve(a, json!("for a"));

    assert_eq!(slot_a.await.unwrap().unwrap(), json!("for a"));
    assert_eq!(slot_b.await.unwrap().unwrap(), json!("for b"));
}

/// Cancelling fails the waiter with `Cancelled` and discards a late response.
#[tokio::test]
async fn cancel_fails_waiter_and_discards_late_response() {
    let table = CorrelationTable::new();
    let (id, slot) = table.register("slow").unwrap();

    assert!(table.cancel(id));
    assert!(!table.cancel(id), "second cancel must be a no-op");
    assert!(!table.resolve(id, json!("late")), "late response must be discarded");

    let err = slot.await.unwrap().unwrap_err();
    assert!(matches!(err, RpcError::Cancelled(_)), "got {err}");
}

/// Closing rejects every waiter with the reason and blocks new registrations.
#[tokio::test]
async fn close_rejects_all_and_blocks_registration() {
    let table = CorrelationTable::new();
    let (_, first) = table.register("a").unwrap();
    let (_, second) = table.register("b").unwrap();

    let rejected = table.close(&RpcError::Transport("connection closed".into()));
    assert_eq!(rejected, 2);
    assert!(table.is_closed());

    for slot in [first, second] {
        let err = slot.await.unwrap().unwrap_err();
        assert!(err.is_connection_error(), "got {err}");
    }

    let err = table.register("c").unwrap_err();
    assert!(matches!(err, RpcError::Transport(ref m) if m == "connection closed"));
}

/// Only the first close reason is kept.
#[test]
fn first_close_reason_wins() {
    let table = CorrelationTable::new();
    table.close(&RpcError::NotRunning("client stopped".into()));
    table.close(&RpcError::Transport("connection closed".into()));

    let err = table.register("x").unwrap_err();
    assert!(matches!(err, RpcError::NotRunning(_)), "got {err}");
}

/// Removing an entry drops it silently.
#[test]
fn remove_drops_entry() {
    let table = CorrelationTable::new();
    let (id, _slot) = table.register("x").unwrap();

    assert!(table.remove(id));
    assert!(!table.remove(id));
    assert!(table.is_empty());
}
