//! Session manager integration tests: allocation, persistence, cleanup.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use summoner_fabric::{
    ChannelMessage, SessionManager, SessionMode, StoreClient, Subscriber,
};
use support::FakeStore;

#[tokio::test]
async fn test_summoner_session_roundtrip() {
    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());

    let descriptor = manager.create_summoner(3, 3600, None).await.unwrap();
    assert_eq!(descriptor.mode, SessionMode::Summoner);
    assert_eq!(descriptor.max_children, 3);
    assert_eq!(descriptor.task_queues.len(), 3);
    assert_eq!(descriptor.report_queues().len(), 1);
    assert!(descriptor.has_monitor());
    assert!(descriptor.prefix.starts_with("summoner:"));

    let loaded = manager.load(&descriptor.session_id).await.unwrap().unwrap();
    assert_eq!(loaded, descriptor);
}

#[tokio::test]
async fn test_sequenced_allocation_skips_occupied_slots() {
    let store = FakeStore::start().await;
    let mut client = StoreClient::new(store.config());
    client.set("proj-host-001:config", "{}", None).await.unwrap();
    client.set("proj-host-003:config", "{}", None).await.unwrap();

    let mut manager = SessionManager::new(store.config());
    let descriptor = manager
        .create_sequenced("proj", "host", 2, 60)
        .await
        .unwrap();

    assert_eq!(descriptor.prefix, "proj-host-002");
    assert_eq!(descriptor.mode, SessionMode::Sequenced);
    assert_eq!(descriptor.task_queues[0], "proj-host-002:p2c:1");
    assert_eq!(descriptor.report_queues()[1], "proj-host-002:c2p:2");
    assert!(!descriptor.has_monitor());

    let loaded = manager.load_prefix("proj-host-002").await.unwrap().unwrap();
    assert_eq!(loaded, descriptor);
}

#[tokio::test]
async fn test_load_missing_session_returns_none() {
    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());
    assert!(manager.load("no-such-id").await.unwrap().is_none());
    assert!(manager.load_prefix("no-such-prefix").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cleanup_removes_every_key_and_is_idempotent() {
    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());
    let mut client = StoreClient::new(store.config());

    let descriptor = manager.create_summoner(2, 3600, None).await.unwrap();
    // Leave data in a task queue so cleanup has lists to remove.
    client
        .rpush(&descriptor.task_queues[0], &["pending"])
        .await
        .unwrap();

    assert!(manager.cleanup(&descriptor).await.unwrap());
    assert!(manager.load(&descriptor.session_id).await.unwrap().is_none());
    for key in descriptor.referenced_keys() {
        assert!(!store.has_key(&key), "key survived cleanup: {key}");
    }

    // Repeated cleanup reports the session as already gone.
    assert!(!manager.cleanup(&descriptor).await.unwrap());
    assert!(!manager.cleanup_session_id(&descriptor.session_id).await.unwrap());
}

#[tokio::test]
async fn test_monitor_channel_sees_initialized_then_cleanup() {
    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());

    let session_id = "fixed-session-id".to_string();
    let channel = format!("summoner:{session_id}:monitor");

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let handler = Arc::new(move |message: ChannelMessage| {
        sink.lock().unwrap().push(message.payload);
    });
    let subscriber = Subscriber::subscribe(&store.config(), &channel, handler, None)
        .await
        .unwrap();

    let descriptor = manager
        .create_summoner(1, 60, Some(session_id.clone()))
        .await
        .unwrap();
    assert!(manager.cleanup(&descriptor).await.unwrap());

    // Give the subscriber task time to deliver both events.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if events.lock().unwrap().len() >= 2 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "monitor events not delivered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let captured = events.lock().unwrap().clone();
    assert_eq!(captured.len(), 2, "expected exactly initialized + cleanup");
    assert!(captured[0].contains("\"event\":\"initialized\""));
    assert!(captured[0].contains(&session_id));
    assert!(captured[1].contains("\"event\":\"cleanup\""));

    subscriber.close().await;
}
