//! Client state machine, shutdown and connection-loss behaviour.

use std::time::Duration;

use serde_json::json;

use agent_rpc::{ClientConfig, ConnectionState, RpcClient, RpcError};

use super::test_helpers::{
    attach, connected_client, eventually, oversized_params, stalled_client, WAIT,
};

/// `force_stop` before `start`, and twice in a row, never blocks or fails.
#[tokio::test]
async fn force_stop_is_always_safe() {
    let client = RpcClient::new(ClientConfig::streams()).unwrap();

    client.force_stop();
    client.force_stop();

    assert_eq!(client.state(), ConnectionState::Stopped);
    assert!(client.stop().await.is_ok(), "stop after force_stop must be a no-op");
}

/// `stop` on a never-started client is a no-op that ends in `Stopped`.
#[tokio::test]
async fn stop_before_start() {
    let client = RpcClient::new(ClientConfig::streams()).unwrap();

    client.stop().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Stopped);
}

/// Start, stop, stop again: the second stop is a no-op and later calls
/// fail with "not running".
#[tokio::test]
async fn stop_is_idempotent_and_blocks_requests() {
    let (client, mut agent) = connected_client().await;
    assert_eq!(client.state(), ConnectionState::Running);

    client.stop().await.unwrap();
    client.stop().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Stopped);
    assert!(agent.client_closed().await, "stop must close the outbound stream");

    let err = client.request("ping", json!({"message": "hi"})).await.unwrap_err();
    assert!(matches!(err, RpcError::NotRunning(ref m) if m.contains("stopped")), "got {err}");
}

/// A stopped client cannot be restarted.
#[tokio::test]
async fn stopped_client_cannot_restart() {
    let (client, _agent) = connected_client().await;
    client.stop().await.unwrap();

    let err = client.start().await.unwrap_err();
    assert!(matches!(err, RpcError::NotRunning(_)), "got {err}");
    assert_eq!(client.state(), ConnectionState::Stopped);
}

/// `start` on a running client is a no-op.
#[tokio::test]
async fn start_while_running_is_noop() {
    let (client, _agent) = connected_client().await;

    client.start().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Running);
}

/// Calls in flight during `stop` fail with "not running".
#[tokio::test]
async fn stop_rejects_in_flight_calls() {
    let (client, mut agent) = connected_client().await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.request("forever", json!({})).await }
    });
    let _ = agent.next_message().await;

    client.stop().await.unwrap();

    let err = tokio::time::timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, RpcError::NotRunning(_)), "got {err}");
}

/// When the agent's stream ends, every outstanding call fails with a
/// connection error and the client moves to `Failed`.
#[tokio::test]
async fn stream_loss_fails_every_pending_call() {
    let (client, mut agent) = connected_client().await;

    let calls: Vec<_> = (0..3)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move { client.request("work", json!({ "n": n })).await })
        })
        .collect();
    for _ in 0..3 {
        let _ = agent.next_message().await;
    }
    assert_eq!(client.pending_requests(), 3);

    drop(agent);

    for call in calls {
        let err = tokio::time::timeout(WAIT, call)
            .await
            .expect("no caller may hang")
            .unwrap()
            .unwrap_err();
        assert!(err.is_connection_error(), "got {err}");
    }
    assert!(eventually(|| client.state() == ConnectionState::Failed).await);
    assert!(client
        .last_error()
        .is_some_and(|e| e.contains("connection lost")));

    let err = client.request("ping", json!({})).await.unwrap_err();
    assert!(matches!(err, RpcError::NotRunning(ref m) if m.contains("failed")), "got {err}");
    assert!(client.stop().await.is_ok(), "stop after failure is a no-op");
    assert_eq!(client.state(), ConnectionState::Failed);
}

/// Malformed frames are skipped and the loop keeps routing.
#[tokio::test]
async fn malformed_frames_are_skipped() {
    let (client, mut agent) = connected_client().await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.request("ping", json!({"message": "ok"})).await }
    });
    let request = agent.next_message().await;

    agent.send_raw("this is not json").await;
    agent.send_raw("").await;
    agent.send_raw(r#"{"jsonrpc":"2.0","id":12345}"#).await;
    agent.send_raw(r#"[{"jsonrpc":"2.0","method":"batched"}]"#).await;
    agent.send_raw(r#"{"jsonrpc":"2.0","id":"no-such-id","result":1}"#).await;
    agent
        .respond(&request["id"], json!({"message": "pong: ok"}))
        .await;

    let result = tokio::time::timeout(WAIT, call).await.unwrap().unwrap().unwrap();
    assert_eq!(result["message"], "pong: ok");
    assert_eq!(client.state(), ConnectionState::Running);
}

/// State changes are observable through the watch receiver.
#[tokio::test]
async fn state_changes_are_published() {
    let client = RpcClient::new(ClientConfig::streams()).unwrap();
    let mut states = client.state_changes();
    assert_eq!(*states.borrow_and_update(), ConnectionState::NotStarted);

    let _agent = attach(&client).await;
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Running);

    client.stop().await.unwrap();
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Stopped);
}

/// `force_stop` while a call is pending releases the caller.
#[tokio::test]
async fn force_stop_releases_waiters() {
    let (client, mut agent) = connected_client().await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.request("forever", json!({})).await }
    });
    let _ = agent.next_message().await;

    client.force_stop();
    client.force_stop();

    let err = tokio::time::timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, RpcError::NotRunning(_)), "got {err}");
    assert_eq!(client.state(), ConnectionState::Stopped);
}

/// `force_stop` releases a caller stuck writing to a peer that stopped reading.
#[tokio::test]
async fn force_stop_releases_stalled_write() {
    let (client, _peer) = stalled_client().await;

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.request("slow", oversized_params()).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!call.is_finished(), "the write should be stalled");

    client.force_stop();

    let err = tokio::time::timeout(WAIT, call)
        .await
        .expect("caller must be released")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RpcError::NotRunning(_)), "got {err}");
    assert_eq!(client.state(), ConnectionState::Stopped);
}

/// `stop` completes and releases a notification stuck on a stalled peer.
#[tokio::test]
async fn stop_releases_stalled_notify() {
    let (client, _peer) = stalled_client().await;

    let notify = tokio::spawn({
        let client = client.clone();
        async move { client.notify("bulk", oversized_params()).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(WAIT, client.stop())
        .await
        .expect("stop must not hang")
        .unwrap();

    let err = tokio::time::timeout(WAIT, notify)
        .await
        .expect("notify must be released")
        .unwrap()
        .unwrap_err();
    assert!(err.is_connection_error(), "got {err}");
    assert_eq!(client.state(), ConnectionState::Stopped);
}

/// A protocol version that matches lets `start` complete.
#[tokio::test]
async fn protocol_version_match_starts() {
    let mut config = ClientConfig::streams();
    config.expected_protocol_version = Some(2);
    let client = RpcClient::new(config).unwrap();

    let (client_side, agent_side) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_side);
    let agent = tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        let (read, mut write) = tokio::io::split(agent_side);
        let mut lines = BufReader::new(read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let request: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(request["method"], "ping");
        let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": {"protocolVersion": 2}});
        write.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
        (lines, write)
    });

    client.start_with_streams(client_read, client_write).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Running);
    let _keep = agent.await.unwrap();
}

/// A mismatched protocol version fails `start` and leaves the client `Failed`.
#[tokio::test]
async fn protocol_version_mismatch_fails_start() {
    let mut config = ClientConfig::streams();
    config.expected_protocol_version = Some(3);
    let client = RpcClient::new(config).unwrap();

    let (client_side, agent_side) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_side);
    let agent = tokio::spawn(async move {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        let (read, mut write) = tokio::io::split(agent_side);
        let mut lines = BufReader::new(read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let request: serde_json::Value = serde_json::from_str(&line).unwrap();
        let reply = json!({"jsonrpc": "2.0", "id": request["id"], "result": {"protocolVersion": 2}});
        write.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
        (lines, write)
    });

    let err = client
        .start_with_streams(client_read, client_write)
        .await
        .unwrap_err();
    assert!(
        matches!(err, RpcError::Launch(ref m) if m.contains("expected 3") && m.contains("reports 2")),
        "got {err}"
    );
    assert_eq!(client.state(), ConnectionState::Failed);
    let _keep = agent.await.unwrap();
}
