use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::{HookClient, HookConfig, HookError, HookListener, SessionEnd};

fn quick(idle_ms: u64) -> HookConfig {
    HookConfig {
        idle_timeout: Duration::from_millis(idle_ms),
        request_timeout: Duration::from_secs(2),
        buffer: 8,
        shutdown_grace: Duration::from_millis(200),
    }
}

async fn spawn_listener(
    config: HookConfig,
) -> (
    String,
    tokio::task::JoinHandle<crate::Result<crate::HookSession>>,
) {
    let listener = HookListener::bind("127.0.0.1:0", config).await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (addr, tokio::spawn(listener.run()))
}

#[tokio::test]
async fn chunks_arrive_in_order_and_finish_stops_listener() {
    let (addr, listener) = spawn_listener(quick(5_000)).await;

    let mut client = HookClient::new(addr, quick(5_000)).unwrap();
    client.start().unwrap();
    for chunk in ["one\n", "two\n", "three\n"] {
        client.send(chunk).await.unwrap();
    }
    let stats = client.stop().await.unwrap();
    assert_eq!(stats.delivered, 3);
    assert_eq!(stats.failed, 0);
    assert!(stats.finished);

    let session = tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(session.end, SessionEnd::Finished);
    assert_eq!(session.text(), "one\ntwo\nthree\n");
}

#[tokio::test]
async fn silent_listener_times_out() {
    let (_addr, listener) = spawn_listener(quick(100)).await;
    let session = tokio::time::timeout(Duration::from_secs(5), listener)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(session.end, SessionEnd::IdleTimeout);
    assert!(session.chunks.is_empty());
}

#[tokio::test]
async fn keepalives_hold_session_open_past_idle_timeout() {
    let (addr, listener) = spawn_listener(quick(300)).await;

    let mut client = HookClient::new(addr, quick(300)).unwrap();
    client.start().unwrap();
    tokio::time::sleep(Duration::from_millis(900)).await;
    client.send("late").await.unwrap();
    let stats = client.stop().await.unwrap();
    assert!(stats.keepalives >= 2, "{stats:?}");
    assert_eq!(stats.delivered, 1);

    let session = listener.await.unwrap().unwrap();
    assert_eq!(session.end, SessionEnd::Finished);
    assert_eq!(session.text(), "late");
}

#[tokio::test]
async fn send_requires_running_client() {
    let mut client = HookClient::new("127.0.0.1:1", quick(1_000)).unwrap();
    assert!(matches!(
        client.send("x").await,
        Err(HookError::NotRunning)
    ));

    client.start().unwrap();
    assert!(matches!(client.start(), Err(HookError::AlreadyStarted)));
    client.stop().await.unwrap();
    assert!(!client.is_running());
    assert!(client.send("x").await.is_err());
}

#[tokio::test]
async fn unreachable_listener_counts_failures() {
    // Bind and drop to get a port nothing listens on.
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };
    let mut client = HookClient::new(format!("127.0.0.1:{port}"), quick(5_000)).unwrap();
    client.start().unwrap();
    client.send("lost").await.unwrap();
    let stats = client.stop().await.unwrap();
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.failed, 1);
    assert!(!stats.finished);
}

#[tokio::test]
async fn parent_cancellation_stops_listener() {
    let parent = CancellationToken::new();
    let listener = HookListener::bind("127.0.0.1:0", quick(5_000))
        .await
        .unwrap()
        .with_cancellation(&parent);
    let handle = tokio::spawn(listener.run());
    parent.cancel();
    let session = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(session.end, SessionEnd::Cancelled);
}

#[tokio::test]
async fn chunk_stream_sees_updates_live() {
    let mut listener = HookListener::bind("127.0.0.1:0", quick(5_000))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let mut live = listener.chunks();
    let handle = tokio::spawn(listener.run());

    let mut client = HookClient::new(addr, quick(5_000)).unwrap();
    client.start().unwrap();
    client.send("first").await.unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), live.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&got[..], b"first");

    client.stop().await.unwrap();
    handle.await.unwrap().unwrap();
    assert!(live.next().await.is_none());
}

#[tokio::test]
async fn stalled_listener_is_cut_off_by_request_timeout() {
    // Accepts connections but never answers.
    let stalled = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = stalled.local_addr().unwrap().to_string();
    let _accepting = tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((sock, _)) = stalled.accept().await {
            open.push(sock);
        }
    });

    let config = HookConfig {
        request_timeout: Duration::from_millis(200),
        ..quick(60_000)
    };
    let mut client = HookClient::new(addr, config).unwrap();
    client.start().unwrap();
    client.send("lost").await.unwrap();
    let stats = tokio::time::timeout(Duration::from_secs(5), client.stop())
        .await
        .expect("request timeout must bound delivery")
        .unwrap();
    assert_eq!(stats.delivered, 0);
    assert_eq!(stats.failed, 1);
    assert!(!stats.finished);
}
