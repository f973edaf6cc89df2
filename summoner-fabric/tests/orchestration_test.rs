//! End-to-end dispatcher/worker tests over the fake store.

mod support;

use std::sync::Arc;
use summoner_fabric::{
    Dispatcher, FabricError, Message, ReportStatus, SessionManager, TaskHandler, TaskMessage,
    Worker, parse_message,
};
use support::FakeStore;

/// Scenario: one task through one worker, then cleanup.
#[tokio::test]
async fn test_happy_path_single_task() {
    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());
    let session = manager.create_summoner(1, 3600, None).await.unwrap();

    let mut worker = Worker::with_default_handler(store.config(), session.session_id.clone(), 1);
    let runner = tokio::spawn(async move { worker.run(Some(1), 1).await });

    let mut dispatcher = Dispatcher::connect(store.config(), &session.session_id)
        .await
        .unwrap();
    let (ok, task_id) = dispatcher
        .send_task(1, "Process A", None, None, None)
        .await
        .unwrap();
    assert!(ok);

    let report = dispatcher.receive_report(10).await.unwrap().unwrap();
    assert_eq!(report.status, ReportStatus::Success);
    assert_eq!(report.task_id, task_id);
    assert_eq!(report.child_id, 1);
    assert!(report.duration_ms.unwrap() > 0);
    assert!(report.result.is_some());
    assert!(report.error.is_none());

    let outcome = runner.await.unwrap().unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.tasks_received, 1);
    assert_eq!(outcome.tasks_completed, 1);
    assert_eq!(outcome.tasks_failed, 0);

    assert!(manager.cleanup(&session).await.unwrap());
    assert!(manager.load(&session.session_id).await.unwrap().is_none());
}

/// Scenario: a broadcast shutdown lands once on every task queue.
#[tokio::test]
async fn test_broadcast_shutdown_fans_out() {
    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());
    let session = manager.create_summoner(3, 3600, None).await.unwrap();

    let mut dispatcher = Dispatcher::connect(store.config(), &session.session_id)
        .await
        .unwrap();
    let acks = dispatcher.send_shutdown("test", true, None).await.unwrap();
    assert_eq!(acks, vec![true, true, true]);

    for queue in &session.task_queues {
        let items = store.list_snapshot(queue);
        assert_eq!(items.len(), 1, "expected one envelope on {queue}");
        let Message::Shutdown(shutdown) = parse_message(&items[0]).unwrap() else {
            panic!("expected a shutdown envelope on {queue}");
        };
        assert_eq!(shutdown.reason, "test");
        assert_eq!(shutdown.target_child_id, None);
    }
}

/// Scenario: worker finishes its task, then honors the shutdown and
/// announces `stopped` on the monitor channel.
#[tokio::test]
async fn test_worker_processes_then_honors_shutdown() {
    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());
    let session = manager.create_summoner(1, 3600, None).await.unwrap();

    let listener = summoner_fabric::observer::SessionListener::start(
        &store.config(),
        &session.session_id,
        &session.monitor_channel,
    )
    .await
    .unwrap();

    let mut worker = Worker::with_default_handler(store.config(), session.session_id.clone(), 1);
    let runner = tokio::spawn(async move { worker.run(None, 1).await });

    let mut dispatcher = Dispatcher::connect(store.config(), &session.session_id)
        .await
        .unwrap();
    dispatcher
        .send_task(1, "first and only", None, None, None)
        .await
        .unwrap();
    let report = dispatcher.receive_report(10).await.unwrap().unwrap();
    assert_eq!(report.status, ReportStatus::Success);

    let acks = dispatcher.send_shutdown("done", true, Some(1)).await.unwrap();
    assert_eq!(acks, vec![true]);

    let outcome = runner.await.unwrap().unwrap();
    assert!(outcome.success);
    assert!(outcome.shutdown_received);
    assert_eq!(outcome.tasks_completed, 1);

    // The worker's lifecycle envelopes reached the monitor channel,
    // ending with `stopped`.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    let mut statuses: Vec<String> = Vec::new();
    loop {
        statuses.extend(
            listener
                .drain(usize::MAX)
                .into_iter()
                .filter(|r| r.message_type == "status")
                .map(|r| r.content),
        );
        if statuses.last().map(String::as_str) == Some("stopped") {
            assert!(statuses.contains(&"started".to_string()));
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "stopped status never arrived"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    listener.stop().await;
}

/// FIFO on the task list: a task queued before the shutdown still runs.
#[tokio::test]
async fn test_queued_task_beats_later_shutdown() {
    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());
    let session = manager.create_summoner(1, 3600, None).await.unwrap();

    let mut dispatcher = Dispatcher::connect(store.config(), &session.session_id)
        .await
        .unwrap();
    dispatcher.send_task(1, "queued early", None, None, None).await.unwrap();
    dispatcher.send_shutdown("after task", true, Some(1)).await.unwrap();

    let mut worker = Worker::with_default_handler(store.config(), session.session_id.clone(), 1);
    let outcome = worker.run(None, 1).await.unwrap();

    assert!(outcome.shutdown_received);
    assert_eq!(outcome.tasks_completed, 1);

    let report = dispatcher.receive_report(5).await.unwrap().unwrap();
    assert_eq!(report.status, ReportStatus::Success);
}

#[tokio::test]
async fn test_child_id_out_of_range_rejected() {
    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());
    let session = manager.create_summoner(2, 3600, None).await.unwrap();

    let mut dispatcher = Dispatcher::connect(store.config(), &session.session_id)
        .await
        .unwrap();
    for bad in [0, 3] {
        let err = dispatcher
            .send_task(bad, "nope", None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::ChildIdOutOfRange { .. }));
    }
}

#[tokio::test]
async fn test_connect_to_missing_session_fails() {
    let store = FakeStore::start().await;
    let err = Dispatcher::connect(store.config(), "ghost").await.unwrap_err();
    assert!(matches!(err, FabricError::SessionNotFound(_)));
}

#[tokio::test]
async fn test_fan_out_caps_at_max_children() {
    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());
    let session = manager.create_summoner(2, 3600, None).await.unwrap();

    let mut dispatcher = Dispatcher::connect(store.config(), &session.session_id)
        .await
        .unwrap();
    let prompts: Vec<String> = (1..=4).map(|i| format!("task {i}")).collect();
    let outcomes = dispatcher.send_tasks_to_all(&prompts).await.unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.ok));
    assert_eq!(store.list_snapshot(&session.task_queues[0]).len(), 1);
    assert_eq!(store.list_snapshot(&session.task_queues[1]).len(), 1);
}

/// Non-report garbage on the report queue is discarded, not fatal.
#[tokio::test]
async fn test_receive_all_reports_skips_non_reports() {
    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());
    let session = manager.create_summoner(1, 3600, None).await.unwrap();

    let mut client = summoner_fabric::StoreClient::new(store.config());
    let report_queue = session.report_queue(1).unwrap().to_string();
    let real_report = Message::Report(summoner_fabric::ReportMessage::success(
        "t-1",
        &session.session_id,
        1,
        serde_json::json!("fine"),
        Some(5),
    ))
    .to_json()
    .unwrap();
    client
        .rpush(&report_queue, &["not even json", &real_report])
        .await
        .unwrap();

    let mut dispatcher = Dispatcher::connect(store.config(), &session.session_id)
        .await
        .unwrap();
    let reports = dispatcher.receive_all_reports(1, 5).await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].task_id, "t-1");
}

/// A handler error becomes a failure report and the worker stays alive.
#[tokio::test]
async fn test_handler_error_becomes_failure_report() {
    struct FailingHandler;

    #[async_trait::async_trait]
    impl TaskHandler for FailingHandler {
        async fn handle(&self, _task: &TaskMessage) -> Result<serde_json::Value, String> {
            Err("boom".to_string())
        }
    }

    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());
    let session = manager.create_summoner(1, 3600, None).await.unwrap();

    let mut worker = Worker::new(
        store.config(),
        session.session_id.clone(),
        1,
        Arc::new(FailingHandler),
    );
    let runner = tokio::spawn(async move { worker.run(Some(1), 1).await });

    let mut dispatcher = Dispatcher::connect(store.config(), &session.session_id)
        .await
        .unwrap();
    dispatcher.send_task(1, "will fail", None, None, None).await.unwrap();

    let report = dispatcher.receive_report(10).await.unwrap().unwrap();
    assert_eq!(report.status, ReportStatus::Failure);
    assert_eq!(report.error.as_deref(), Some("boom"));
    assert_eq!(
        report.metadata.get("code").and_then(|v| v.as_str()),
        Some(summoner_fabric::TASK_EXECUTION_ERROR_CODE)
    );

    let outcome = runner.await.unwrap().unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.tasks_failed, 1);
}

/// max_tasks bounds the loop even with more work queued.
#[tokio::test]
async fn test_max_tasks_limit_stops_loop() {
    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());
    let session = manager.create_summoner(1, 3600, None).await.unwrap();

    let mut dispatcher = Dispatcher::connect(store.config(), &session.session_id)
        .await
        .unwrap();
    for i in 1..=3 {
        dispatcher
            .send_task(1, &format!("task {i}"), None, None, None)
            .await
            .unwrap();
    }

    let mut worker = Worker::with_default_handler(store.config(), session.session_id.clone(), 1);
    let outcome = worker.run(Some(2), 1).await.unwrap();

    assert_eq!(outcome.tasks_completed, 2);
    // The third task is still queued.
    assert_eq!(store.list_snapshot(&session.task_queues[0]).len(), 1);
}

/// The external stop handle drains the loop between iterations.
#[tokio::test]
async fn test_stop_handle_drains_worker() {
    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());
    let session = manager.create_summoner(1, 3600, None).await.unwrap();

    let mut worker = Worker::with_default_handler(store.config(), session.session_id.clone(), 1);
    let stop = worker.stop_handle();
    let runner = tokio::spawn(async move { worker.run(None, 1).await });

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    stop.stop();

    let outcome = runner.await.unwrap().unwrap();
    assert!(outcome.success);
    assert!(!outcome.shutdown_received);
    assert_eq!(outcome.tasks_received, 0);
}

/// A poison message on the control list drains the worker.
#[tokio::test]
async fn test_control_list_poison_drains_worker() {
    let store = FakeStore::start().await;
    let mut manager = SessionManager::new(store.config());
    let session = manager.create_summoner(1, 3600, None).await.unwrap();

    let mut dispatcher = Dispatcher::connect(store.config(), &session.session_id)
        .await
        .unwrap();
    dispatcher.send_control("drain").await.unwrap();

    let mut worker = Worker::with_default_handler(store.config(), session.session_id.clone(), 1);
    let outcome = worker.run(None, 1).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.tasks_received, 0);
}
