//! Worker loop and reaper against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use workqueue::clock::{Clock, ManualClock, SystemClock};
use workqueue::engine::{Reaper, ReaperConfig, WorkQueue, Worker, WorkerConfig};
use workqueue::error::Error;
use workqueue::model::*;
use workqueue::registry::WorkerRegistry;
use workqueue::store::InMemoryWorkStore;

fn email_registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::with_builtins();
    registry
        .register_fn("EMAIL", |input| async move {
            match input["to"].as_str() {
                Some(to) if to.contains('@') => Ok(WorkOutcome::ok(json!({ "sent": to }))),
                _ => Err(Error::InvalidInput("missing recipient".to_string())),
            }
        })
        .unwrap();
    registry
}

fn queue_with(registry: WorkerRegistry, clock: Arc<dyn Clock>) -> WorkQueue {
    WorkQueue::new(Arc::new(InMemoryWorkStore::new()), Arc::new(registry)).with_clock(clock)
}

#[tokio::test]
async fn run_once_executes_and_reports() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = queue_with(email_registry(), clock.clone());
    let worker = Worker::new(queue.clone(), WorkerConfig::new("worker-1"));

    let item = queue
        .add_work(NewWorkItem::new("EMAIL").input(json!({"to": "a@b.com"})))
        .await
        .unwrap();

    let done = worker.run_once().await.unwrap().unwrap();
    assert_eq!(done.id, item.id);
    assert_eq!(done.status(clock.now()), WorkStatus::Success);
    assert_eq!(done.result, Some(json!({"sent": "a@b.com"})));
    assert_eq!(done.worker.as_deref(), Some("worker-1"));

    assert!(worker.run_once().await.unwrap().is_none());
}

#[tokio::test]
async fn handler_error_fails_item_and_retries() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = queue_with(email_registry(), clock.clone());
    let worker = Worker::new(queue.clone(), WorkerConfig::new("worker-1"));

    let item = queue
        .add_work(NewWorkItem::new("EMAIL").input(json!({})).retries(1))
        .await
        .unwrap();

    let failed = worker.run_once().await.unwrap().unwrap();
    assert_eq!(failed.status(clock.now()), WorkStatus::Failed);
    assert!(
        failed.error.as_ref().unwrap()["message"]
            .as_str()
            .unwrap()
            .contains("missing recipient")
    );

    let retry = worker.run_once().await.unwrap().unwrap();
    assert_eq!(retry.original, Some(item.id));
    assert_eq!(retry.retries, 0);
}

#[tokio::test]
async fn worker_only_takes_configured_types() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = queue_with(email_registry(), clock.clone());
    let worker = Worker::new(
        queue.clone(),
        WorkerConfig::new("hb").types(vec!["HEARTBEAT".to_string()]),
    );

    queue
        .add_work(NewWorkItem::new("EMAIL").input(json!({"to": "a@b.com"})))
        .await
        .unwrap();
    assert!(worker.run_once().await.unwrap().is_none());

    queue
        .add_work(NewWorkItem::new("HEARTBEAT").input(json!(1)))
        .await
        .unwrap();
    let done = worker.run_once().await.unwrap().unwrap();
    assert_eq!(done.work_type, "HEARTBEAT");
    assert_eq!(done.result, Some(json!({"echo": 1})));
}

#[tokio::test]
async fn unknown_type_item_is_failed() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = queue_with(WorkerRegistry::with_builtins(), clock.clone());
    let worker = Worker::new(
        queue.clone(),
        WorkerConfig::new("w").types(vec!["FAX".to_string()]),
    );

    queue.add_work(NewWorkItem::new("FAX")).await.unwrap();
    let done = worker.run_once().await.unwrap().unwrap();
    assert_eq!(done.status(clock.now()), WorkStatus::Failed);
}

#[tokio::test]
async fn result_after_lease_expiry_is_discarded() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut registry = WorkerRegistry::empty();
    let slow_clock = clock.clone();
    registry
        .register_fn("SLOW", move |_| {
            let clock = slow_clock.clone();
            async move {
                clock.advance_ms(2_000);
                Ok(WorkOutcome::ok(json!("late")))
            }
        })
        .unwrap();
    let queue = queue_with(registry, clock.clone());
    let worker = Worker::new(queue.clone(), WorkerConfig::new("w"));

    let item = queue
        .add_work(NewWorkItem::new("SLOW").timeout_ms(1_000))
        .await
        .unwrap();
    assert!(worker.run_once().await.unwrap().is_none());

    let stored = queue.work(item.id).await.unwrap().unwrap();
    assert_eq!(stored.status(clock.now()), WorkStatus::Failed);
    assert!(stored.stopped.is_none());
}

#[tokio::test]
async fn worker_without_types_is_a_config_error() {
    let queue = queue_with(WorkerRegistry::empty(), Arc::new(SystemClock));
    let worker = Worker::new(queue, WorkerConfig::new("w"));
    assert!(matches!(worker.run_once().await, Err(Error::Config(_))));
    assert!(matches!(worker.run().await, Err(Error::Config(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_drains_queue_until_shutdown() {
    let queue = queue_with(email_registry(), Arc::new(SystemClock));
    for n in 0..10 {
        queue
            .add_work(NewWorkItem::new("EMAIL").input(json!({ "to": format!("u{n}@b.com") })))
            .await
            .unwrap();
    }

    let worker = Worker::new(
        queue.clone(),
        WorkerConfig::new("loop")
            .poll_interval(Duration::from_millis(10))
            .max_concurrent(3),
    );
    let runner = worker.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    let done = WorkFilter::default().statuses([WorkStatus::Success]);
    for _ in 0..200 {
        if queue.work_count(&done).await.unwrap() == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(queue.work_count(&done).await.unwrap(), 10);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

fn panicking_registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::with_builtins();
    registry
        .register_fn("BOOM", |input| async move {
            match input.get("ok") {
                Some(_) => Ok(WorkOutcome::ok(json!(null))),
                None => panic!("handler blew up"),
            }
        })
        .unwrap();
    registry
}

#[tokio::test]
async fn panicking_handler_fails_item_and_retries() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = queue_with(panicking_registry(), clock.clone());
    let worker = Worker::new(queue.clone(), WorkerConfig::new("w"));

    let item = queue
        .add_work(NewWorkItem::new("BOOM").retries(1))
        .await
        .unwrap();
    let failed = worker.run_once().await.unwrap().unwrap();
    assert_eq!(failed.id, item.id);
    assert_eq!(failed.status(clock.now()), WorkStatus::Failed);
    assert!(
        failed.error.as_ref().unwrap()["message"]
            .as_str()
            .unwrap()
            .starts_with("handler aborted")
    );
    assert_eq!(queue.retry_chain(item.id).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_handler_does_not_leak_capacity() {
    let queue = queue_with(panicking_registry(), Arc::new(SystemClock));
    queue.add_work(NewWorkItem::new("BOOM")).await.unwrap();

    let worker = Worker::new(
        queue.clone(),
        WorkerConfig::new("loop")
            .poll_interval(Duration::from_millis(10))
            .max_concurrent(1),
    );
    let runner = worker.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    let heartbeat = queue
        .add_work(NewWorkItem::new("HEARTBEAT").input(json!(1)))
        .await
        .unwrap();
    let done = WorkFilter::default().statuses([WorkStatus::Success]);
    for _ in 0..200 {
        if queue.work_count(&done).await.unwrap() == 1 && worker.active() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let finished = queue.work(heartbeat.id).await.unwrap().unwrap();
    assert_eq!(finished.success, Some(true));
    assert_eq!(worker.active(), 0);

    worker.shutdown();
    handle.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Reaper
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reaper_reports_expired_leases_without_writing() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = queue_with(email_registry(), clock.clone());
    let reaper = Reaper::new(queue.clone(), ReaperConfig::default());

    let short = queue
        .add_work(NewWorkItem::new("EMAIL").timeout_ms(1_000))
        .await
        .unwrap();
    let long = queue
        .add_work(NewWorkItem::new("EMAIL").timeout_ms(60_000))
        .await
        .unwrap();
    queue.allocate_work(&[], "crashed").await.unwrap();
    queue.allocate_work(&[], "crashed").await.unwrap();
    assert!(reaper.sweep().await.unwrap().is_empty());

    clock.advance_ms(1_000);
    let before = queue.work(short.id).await.unwrap().unwrap();
    let expired = reaper.sweep().await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, short.id);
    assert_eq!(queue.work(short.id).await.unwrap().unwrap(), before);

    // Still reported on the next pass until an operator acts.
    assert_eq!(reaper.sweep().await.unwrap().len(), 1);
    queue.remove_work(short.id).await.unwrap();
    assert!(reaper.sweep().await.unwrap().is_empty());

    let long = queue.work(long.id).await.unwrap().unwrap();
    assert_eq!(long.status(clock.now()), WorkStatus::Allocated);
}

#[tokio::test]
async fn reaper_run_stops_on_shutdown() {
    let queue = queue_with(email_registry(), Arc::new(SystemClock));
    let reaper = Reaper::new(
        queue,
        ReaperConfig {
            interval: Duration::from_millis(5),
            ..ReaperConfig::default()
        },
    );
    let runner = reaper.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    reaper.shutdown();
    handle.await.unwrap().unwrap();
}
