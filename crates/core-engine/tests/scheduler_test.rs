//! Integration tests for the task scheduler against a real Postgres
//! instance: admission, dispatch, cancellation, and crash recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use core_db::models::{Priority, Task, TaskStatus, Trigger};
use core_db::queries::tasks::{NewTask, Page, TaskFilter};
use core_test_utils::{create_test_db, drop_test_db};

use core_engine::config::CoreConfig;
use core_engine::pool::WorkerPoolSet;
use core_engine::scheduler::{CancelOutcome, HandlerRegistry, Scheduler, TaskContext, TaskHandler};
use core_engine::store::{PgTaskStore, TaskStore};

struct SlowHandler {
    step_ms: u64,
    steps: i32,
}

#[async_trait]
impl TaskHandler for SlowHandler {
    fn command(&self) -> &str {
        "RefreshMovie"
    }

    async fn execute(&self, ctx: &TaskContext, body: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        for step in 1..=self.steps {
            if ctx.is_cancelled() {
                anyhow::bail!("cancelled");
            }
            tokio::time::sleep(Duration::from_millis(self.step_ms)).await;
            ctx.report_progress(step * (100 / self.steps), None).await;
        }
        Ok(body)
    }
}

struct CountingHandler {
    calls: Arc<AtomicUsize>,
    sleep_ms: u64,
}

#[async_trait]
impl TaskHandler for CountingHandler {
    fn command(&self) -> &str {
        "Busy"
    }

    async fn execute(&self, _ctx: &TaskContext, body: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
        Ok(body)
    }
}

async fn build_scheduler(
    pool: sqlx::PgPool,
    registry: HandlerRegistry,
    pool_sizes: HashMap<String, i32>,
) -> (Arc<dyn TaskStore>, Arc<Scheduler>) {
    let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool));
    let pools = Arc::new(WorkerPoolSet::bootstrap(&store, &pool_sizes).await.unwrap());
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::new(registry),
        pools,
        Arc::new(CoreConfig::default()),
    ));
    (store, scheduler)
}

fn default_pool_sizes() -> HashMap<String, i32> {
    let mut m = HashMap::new();
    m.insert("high-priority".to_string(), 2);
    m.insert("default".to_string(), 3);
    m.insert("background".to_string(), 1);
    m
}

async fn submit_manual(scheduler: &Scheduler, command: &str) -> i64 {
    scheduler
        .submit(NewTask {
            name: command,
            command,
            body: serde_json::json!({}),
            priority: Priority::Normal,
            trigger: Trigger::Manual,
            deadline_ms: None,
            scheduled_task_name: None,
        })
        .await
        .unwrap()
        .task_id
}

async fn fetch(scheduler: &Scheduler, id: i64) -> Task {
    scheduler.get_task(id).await.unwrap()
}

// Scenario 1: manual refresh with cancel.
#[tokio::test]
async fn manual_refresh_cancelled_midway_reaches_aborted_with_partial_progress() {
    let (pool, db_name) = create_test_db().await;

    let mut registry = HandlerRegistry::new();
    registry.register_handler(SlowHandler { step_ms: 500, steps: 10 });
    let (_store, scheduler) = build_scheduler(pool.clone(), registry, default_pool_sizes()).await;

    let cancel = CancellationToken::new();
    let run_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    let id = submit_manual(&scheduler, "RefreshMovie").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let outcome = scheduler.cancel(id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::Cancelled);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    let task = loop {
        let task = fetch(&scheduler, id).await;
        if task.status.is_terminal() || tokio::time::Instant::now() >= deadline {
            break task;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_eq!(task.status, TaskStatus::Aborted);
    assert!(task.progress_percent < 100);

    cancel.cancel();
    let _ = run_handle.await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

// Scenario 2 / P1: overlap coalescing for scheduled tasks.
#[tokio::test]
async fn resubmitting_same_schedule_while_in_flight_reuses_the_task_id() {
    let (pool, db_name) = create_test_db().await;

    let mut registry = HandlerRegistry::new();
    registry.register_handler(SlowHandler { step_ms: 200, steps: 5 });
    let (_store, scheduler) = build_scheduler(pool.clone(), registry, default_pool_sizes()).await;

    let first = scheduler
        .submit(NewTask {
            name: "RssSearch",
            command: "RefreshMovie",
            body: serde_json::json!({}),
            priority: Priority::Normal,
            trigger: Trigger::Scheduled,
            deadline_ms: None,
            scheduled_task_name: Some("RssSearch"),
        })
        .await
        .unwrap();
    assert!(!first.reused);

    let second = scheduler
        .submit(NewTask {
            name: "RssSearch",
            command: "RefreshMovie",
            body: serde_json::json!({}),
            priority: Priority::Normal,
            trigger: Trigger::Scheduled,
            deadline_ms: None,
            scheduled_task_name: Some("RssSearch"),
        })
        .await
        .unwrap();

    assert!(second.reused);
    assert_eq!(second.task_id, first.task_id);

    let filter = TaskFilter {
        statuses: Some(vec![TaskStatus::Queued, TaskStatus::Started, TaskStatus::Cancelling]),
        ..Default::default()
    };
    let in_flight = scheduler.list(&filter, Page { offset: 0, limit: 100 }).await.unwrap();
    let matching = in_flight.iter().filter(|t| t.scheduled_task_name.as_deref() == Some("RssSearch")).count();
    assert_eq!(matching, 1, "at-most-one-per-schedule invariant violated");

    pool.close().await;
    drop_test_db(&db_name).await;
}

// Scenario 4 / P3: pool saturation bounds concurrency to max_workers.
#[tokio::test]
async fn pool_saturation_admits_at_most_max_workers_concurrently() {
    let (pool, db_name) = create_test_db().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register_handler(CountingHandler {
        calls: Arc::clone(&calls),
        sleep_ms: 300,
    });

    let mut sizes = HashMap::new();
    sizes.insert("default".to_string(), 3);
    sizes.insert("high-priority".to_string(), 2);
    sizes.insert("background".to_string(), 1);
    let (_store, scheduler) = build_scheduler(pool.clone(), registry, sizes).await;

    for i in 0..10 {
        scheduler
            .submit(NewTask {
                name: &format!("busy-{i}"),
                command: "Busy",
                body: serde_json::json!({}),
                priority: Priority::Normal,
                trigger: Trigger::Manual,
                deadline_ms: None,
                scheduled_task_name: None,
            })
            .await
            .unwrap();
    }

    let cancel = CancellationToken::new();
    let run_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let filter = TaskFilter {
            statuses: Some(vec![TaskStatus::Completed]),
            command: Some("Busy".to_string()),
            ..Default::default()
        };
        let completed = scheduler.list(&filter, Page { offset: 0, limit: 100 }).await.unwrap();
        if completed.len() == 10 || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 10);

    cancel.cancel();
    let _ = run_handle.await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

// P5: cancel on a terminal task is idempotent and makes no writes.
#[tokio::test]
async fn cancelling_a_terminal_task_returns_already_terminal() {
    let (pool, db_name) = create_test_db().await;

    let mut registry = HandlerRegistry::new();
    registry.register_handler(SlowHandler { step_ms: 10, steps: 1 });
    let (_store, scheduler) = build_scheduler(pool.clone(), registry, default_pool_sizes()).await;

    let id = submit_manual(&scheduler, "RefreshMovie").await;

    let cancel = CancellationToken::new();
    let run_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    let task = scheduler.await_task(id, Duration::from_secs(2)).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let before = fetch(&scheduler, id).await;
    let outcome = scheduler.cancel(id).await.unwrap();
    assert_eq!(outcome, CancelOutcome::AlreadyTerminal);
    let after = fetch(&scheduler, id).await;
    assert_eq!(before.status, after.status);
    assert_eq!(before.ended_at, after.ended_at);

    cancel.cancel();
    let _ = run_handle.await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

// P2: progress is non-decreasing across the run, and the final value is
// 100 iff the task completed.
#[tokio::test]
async fn progress_is_non_decreasing_and_reaches_100_only_on_completion() {
    let (pool, db_name) = create_test_db().await;

    let mut registry = HandlerRegistry::new();
    registry.register_handler(SlowHandler { step_ms: 100, steps: 5 });
    let (_store, scheduler) = build_scheduler(pool.clone(), registry, default_pool_sizes()).await;

    let cancel = CancellationToken::new();
    let run_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    let id = submit_manual(&scheduler, "RefreshMovie").await;

    let mut observed = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let task = fetch(&scheduler, id).await;
        if observed.last() != Some(&task.progress_percent) {
            observed.push(task.progress_percent);
        }
        if task.status.is_terminal() || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(observed.windows(2).all(|w| w[0] <= w[1]), "progress regressed: {observed:?}");

    let task = fetch(&scheduler, id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress_percent, 100);

    cancel.cancel();
    let _ = run_handle.await;
    pool.close().await;
    drop_test_db(&db_name).await;
}

// Scenario 5: crash recovery via the orphan reaper.
#[tokio::test]
async fn reaper_fails_orphaned_started_tasks_after_a_crash() {
    let (pool, db_name) = create_test_db().await;

    let mut registry = HandlerRegistry::new();
    registry.register_handler(SlowHandler { step_ms: 10, steps: 1 });
    let mut timeouts = HashMap::new();
    timeouts.insert("RefreshMovie".to_string(), 1u64);
    let mut config = CoreConfig::default();
    config.task_timeouts = timeouts;

    let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool.clone()));
    let pools = Arc::new(WorkerPoolSet::bootstrap(&store, &default_pool_sizes()).await.unwrap());
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::new(registry),
        pools,
        Arc::new(config),
    ));

    let inserted = store
        .insert_task(NewTask {
            name: "orphan",
            command: "RefreshMovie",
            body: serde_json::json!({}),
            priority: Priority::Normal,
            trigger: Trigger::Manual,
            deadline_ms: None,
            scheduled_task_name: None,
        })
        .await
        .unwrap();

    let started_at = chrono::Utc::now() - chrono::Duration::seconds(20);
    store
        .update_task_status(
            inserted.id,
            &[TaskStatus::Queued],
            TaskStatus::Started,
            Some(started_at),
            None,
            None,
            None,
            None,
        )
        .await
        .unwrap();

    let reaped = scheduler.reap_orphaned().await.unwrap();
    assert_eq!(reaped, 1);

    let task = scheduler.get_task(inserted.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error_message.unwrap().contains("orphaned"));

    pool.close().await;
    drop_test_db(&db_name).await;
}
