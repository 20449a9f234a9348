//! The task scheduler: admission, dispatch, worker execution, completion,
//! and cancellation.
//!
//! Grounded on the dispatch-loop shape of an orchestrator that bounds
//! concurrency with a semaphore, drains completions over an mpsc channel,
//! and honors a `CancellationToken` with a bounded drain window on
//! shutdown. Here the semaphore is replaced by [`crate::pool::WorkerPoolSet`]
//! since admission is partitioned per priority pool rather than global, and
//! CAS transitions go through [`TaskStore`] rather than a raw pool so the
//! whole loop is testable against a fake store.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use core_db::models::{Task, TaskStatus};
use core_db::queries::tasks::{NewTask, Page, TaskFilter};

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::pool::{DispatchOutcome, WorkerPoolSet};
use crate::store::TaskStore;

const MIN_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const PROGRESS_COALESCE_WINDOW: Duration = Duration::from_millis(250);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Context handed to a [`TaskHandler`]: a cancellation signal and a
/// progress reporter coalesced to at most one write per 250ms, with the
/// final report always flushed uncoalesced.
pub struct TaskContext {
    task_id: i64,
    cancel: CancellationToken,
    store: Arc<dyn TaskStore>,
    last_flush: AsyncMutex<Option<Instant>>,
}

impl TaskContext {
    fn new(task_id: i64, cancel: CancellationToken, store: Arc<dyn TaskStore>) -> Self {
        Self {
            task_id,
            cancel,
            store,
            last_flush: AsyncMutex::new(None),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Report progress. Writes are coalesced to at most one per 250ms per
    /// task, except the completion report (`percent >= 100`), which always
    /// flushes immediately.
    pub async fn report_progress(&self, percent: i32, message: Option<&str>) {
        let now = Instant::now();
        let force = percent >= 100;

        {
            let mut guard = self.last_flush.lock().await;
            if !force {
                if let Some(last) = *guard {
                    if now.duration_since(last) < PROGRESS_COALESCE_WINDOW {
                        return;
                    }
                }
            }
            *guard = Some(now);
        }

        if let Err(e) = self
            .store
            .update_task_progress(self.task_id, percent, message)
            .await
        {
            tracing::warn!(task_id = self.task_id, error = %e, "failed to persist progress");
        }
    }
}

/// A unit of work a scheduler can dispatch, keyed by the task's `command`.
///
/// Object-safe so handlers can be registered behind `Box<dyn TaskHandler>`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn command(&self) -> &str;
    async fn execute(
        &self,
        ctx: &TaskContext,
        body: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn TaskHandler) {}
};

/// Maps command names to handlers. Frozen after startup: every command the
/// dispatcher is asked to run must already be registered, and registering
/// the same command twice is a programmer error caught at startup rather
/// than silently overwritten.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. Panics if a handler for the same command is
    /// already registered -- this is a startup-only wiring mistake, not a
    /// runtime condition to recover from.
    pub fn register_handler(&mut self, handler: impl TaskHandler + 'static) {
        let command = handler.command().to_string();
        if self.handlers.contains_key(&command) {
            panic!("duplicate handler registration for command {command}");
        }
        self.handlers.insert(command, Box::new(handler));
    }

    pub fn get(&self, command: &str) -> Option<&dyn TaskHandler> {
        self.handlers.get(command).map(|h| h.as_ref())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("commands", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Outcome of a submission. `reused: true` means an in-flight task for the
/// same schedule was found instead of inserting a new row (the at-most-one-
/// per-schedule overlap guard).
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub task_id: i64,
    pub reused: bool,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyTerminal,
    NotFound,
}

struct InFlight {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

/// The task scheduler. Owns the worker pools, the handler registry, and the
/// set of currently-running cancellation tokens.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    pools: Arc<WorkerPoolSet>,
    config: Arc<CoreConfig>,
    in_flight: AsyncMutex<HashMap<i64, InFlight>>,
    shutdown_grace: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        pools: Arc<WorkerPoolSet>,
        config: Arc<CoreConfig>,
    ) -> Self {
        Self {
            store,
            registry,
            pools,
            config,
            in_flight: AsyncMutex::new(HashMap::new()),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Submit a task. For scheduled triggers, applies the at-most-one-per-
    /// schedule overlap guard: if a non-terminal task already exists for
    /// `scheduled_task_name`, its id is returned with `reused: true` instead
    /// of inserting a duplicate row.
    pub async fn submit(&self, fields: NewTask<'_>) -> CoreResult<SubmitOutcome> {
        if let Some(name) = fields.scheduled_task_name {
            let existing = self
                .store
                .find_in_flight_for_schedule(name)
                .await
                .map_err(CoreError::StoreUnavailable)?;
            if let Some(task) = existing {
                return Ok(SubmitOutcome {
                    task_id: task.id,
                    reused: true,
                });
            }
        }

        let command = fields.command.to_string();
        if self.registry.get(&command).is_none() {
            return Err(CoreError::InvalidArgument(format!(
                "no handler registered for command {command}"
            )));
        }

        let task = self
            .store
            .insert_task(fields)
            .await
            .map_err(CoreError::StoreUnavailable)?;

        if let Err(e) = self.store.record_event(task.id, None, TaskStatus::Queued).await {
            tracing::warn!(task_id = task.id, error = %e, "failed to record queued event");
        }

        Ok(SubmitOutcome {
            task_id: task.id,
            reused: false,
        })
    }

    pub async fn get_task(&self, id: i64) -> CoreResult<Task> {
        self.store
            .get_task(id)
            .await
            .map_err(CoreError::StoreUnavailable)?
            .ok_or_else(|| CoreError::NotFound(format!("task {id}")))
    }

    pub async fn list(&self, filter: &TaskFilter, page: Page) -> CoreResult<Vec<Task>> {
        self.store
            .list_tasks(filter, page)
            .await
            .map_err(CoreError::StoreUnavailable)
    }

    /// Cancel a task. `queued` tasks are cancelled synchronously via CAS;
    /// `started` tasks are asked to cancel cooperatively (their context's
    /// cancellation token is signalled) and reach `aborted` only once the
    /// handler exits, bounded by the task's timeout.
    pub async fn cancel(&self, id: i64) -> CoreResult<CancelOutcome> {
        let task = self
            .store
            .get_task(id)
            .await
            .map_err(CoreError::StoreUnavailable)?;
        let Some(task) = task else {
            return Ok(CancelOutcome::NotFound);
        };

        match task.status {
            TaskStatus::Queued => {
                let ok = cas_abort_queued(&self.store, id)
                    .await
                    .map_err(CoreError::StoreUnavailable)?;
                Ok(if ok {
                    CancelOutcome::Cancelled
                } else {
                    CancelOutcome::AlreadyTerminal
                })
            }
            TaskStatus::Started => {
                let ok = cas_begin_cancel(&self.store, id)
                    .await
                    .map_err(CoreError::StoreUnavailable)?;
                if !ok {
                    return Ok(CancelOutcome::AlreadyTerminal);
                }
                let guard = self.in_flight.lock().await;
                if let Some(entry) = guard.get(&id) {
                    entry.cancel.cancel();
                }
                Ok(CancelOutcome::Cancelled)
            }
            TaskStatus::Cancelling => Ok(CancelOutcome::Cancelled),
            _ => Ok(CancelOutcome::AlreadyTerminal),
        }
    }

    /// Poll until a task reaches a terminal state or `timeout` elapses.
    pub async fn await_task(&self, id: i64, timeout: Duration) -> CoreResult<Task> {
        let deadline = Instant::now() + timeout;
        loop {
            let task = self.get_task(id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            if Instant::now() >= deadline {
                return Ok(task);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// The main dispatch loop. Runs until `cancel` fires, then drains
    /// in-flight work up to `shutdown_grace` before forcibly failing
    /// whatever remains.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut backoff = MIN_BACKOFF;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let dispatched = self.dispatch_ready().await?;

            if dispatched > 0 {
                backoff = MIN_BACKOFF;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => break,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }

        self.drain_on_shutdown().await;
        Ok(())
    }

    /// Fetch queued tasks and admit as many as the pools allow. Returns the
    /// number of tasks dispatched this pass.
    async fn dispatch_ready(self: &Arc<Self>) -> Result<usize> {
        let filter = TaskFilter {
            statuses: Some(vec![TaskStatus::Queued]),
            ..Default::default()
        };
        let queued = self
            .store
            .list_tasks(&filter, Page { offset: 0, limit: 256 })
            .await
            .context("failed to list queued tasks")?;

        let mut dispatched = 0;
        for task in queued {
            let pool_name = WorkerPoolSet::pool_name_for(task.priority).to_string();
            match self.pools.try_dispatch(&pool_name) {
                DispatchOutcome::Accepted => {
                    self.spawn_worker(task, pool_name).await;
                    dispatched += 1;
                }
                DispatchOutcome::RejectedFull | DispatchOutcome::RejectedDisabled => continue,
            }
        }

        Ok(dispatched)
    }

    async fn spawn_worker(self: &Arc<Self>, task: Task, pool_name: String) {
        let scheduler = Arc::clone(self);
        let cancel = CancellationToken::new();
        let task_id = task.id;

        let worker_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            scheduler.run_worker(task, pool_name, worker_cancel).await;
        });

        let mut guard = self.in_flight.lock().await;
        guard.insert(task_id, InFlight { cancel, handle });
    }

    async fn run_worker(self: Arc<Self>, task: Task, pool_name: String, cancel: CancellationToken) {
        let task_id = task.id;

        let started = cas_start(&self.store, task_id).await.unwrap_or(false);

        if !started {
            tracing::info!(task_id, "task was cancelled before dispatch; skipping");
            self.finish_worker(task_id, &pool_name).await;
            return;
        }

        let _ = self
            .store
            .record_event(task_id, Some(TaskStatus::Queued), TaskStatus::Started)
            .await;

        let handler = match self.registry.get(&task.command) {
            Some(h) => h,
            None => {
                tracing::error!(task_id, command = %task.command, "no handler registered at dispatch time");
                let _ = cas_fail(&self.store, task_id, "no handler registered").await;
                self.finish_worker(task_id, &pool_name).await;
                return;
            }
        };

        let ctx = TaskContext::new(task_id, cancel.clone(), Arc::clone(&self.store));
        let timeout = self.config.timeout_for(&task.command);

        tracing::info!(task_id, command = %task.command, timeout_secs = timeout.as_secs(), "dispatching task");

        // Run the handler to its own completion (bounded by the timeout)
        // rather than racing it against cancellation: a handler that checks
        // `ctx.is_cancelled()` must get the chance to return on its own, and
        // a handler that finishes normally despite cancellation must still
        // lose the CAS to whichever transition landed first -- see
        // `finish_as_failed_or_aborted` and the completed branch below. A
        // panic inside the handler is caught here too, so it always reaches
        // `finish_worker` and the pool permit it holds is always released.
        let guarded = AssertUnwindSafe(handler.execute(&ctx, task.body.clone())).catch_unwind();
        let outcome = tokio::time::timeout(timeout, guarded).await;

        match outcome {
            Ok(Ok(Ok(result))) => {
                let completed = cas_complete(&self.store, task_id, result).await.unwrap_or(false);
                if completed {
                    tracing::info!(task_id, "task completed");
                    let _ = self.store.record_event(task_id, Some(TaskStatus::Started), TaskStatus::Completed).await;
                } else {
                    // Lost the CAS to a concurrent cancel: cancelling->aborted
                    // wins regardless of the handler's own return value.
                    let _ = cas_finish_cancel(&self.store, task_id).await;
                    let _ = self.store.record_event(task_id, Some(TaskStatus::Cancelling), TaskStatus::Aborted).await;
                }
            }
            Ok(Ok(Err(e))) => {
                self.finish_as_failed_or_aborted(task_id, &e.to_string()).await;
            }
            Ok(Err(panic)) => {
                let message = panic_message(&panic);
                tracing::error!(task_id, panic = %message, "task handler panicked");
                self.finish_as_failed_or_aborted(task_id, &format!("handler panicked: {message}")).await;
            }
            Err(_elapsed) => {
                tracing::warn!(task_id, timeout_secs = timeout.as_secs(), "task timed out");
                self.finish_as_failed_or_aborted(
                    task_id,
                    &format!("handler timed out after {}s", timeout.as_secs()),
                )
                .await;
            }
        }

        self.finish_worker(task_id, &pool_name).await;
    }

    /// Attempt the CAS to `failed`; if it lost to a concurrent cancel, land
    /// as aborted instead -- cancelling->aborted wins regardless of the
    /// handler's own outcome.
    async fn finish_as_failed_or_aborted(&self, task_id: i64, message: &str) {
        tracing::warn!(task_id, error = %message, "task did not complete successfully");
        let failed = cas_fail(&self.store, task_id, message).await.unwrap_or(false);
        if failed {
            let _ = self.store.record_event(task_id, Some(TaskStatus::Started), TaskStatus::Failed).await;
        } else {
            let _ = cas_finish_cancel(&self.store, task_id).await;
            let _ = self.store.record_event(task_id, Some(TaskStatus::Cancelling), TaskStatus::Aborted).await;
        }
    }

    async fn finish_worker(&self, task_id: i64, pool_name: &str) {
        self.pools.release(pool_name);
        let mut guard = self.in_flight.lock().await;
        guard.remove(&task_id);
    }

    /// On shutdown: wait for in-flight workers to finish on their own up to
    /// `shutdown_grace`, then forcibly fail whatever `started` rows remain.
    async fn drain_on_shutdown(&self) {
        let deadline = Instant::now() + self.shutdown_grace;
        loop {
            let remaining = {
                let guard = self.in_flight.lock().await;
                guard.len()
            };
            if remaining == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut guard = self.in_flight.lock().await;
        for (task_id, entry) in guard.drain() {
            entry.cancel.cancel();
            entry.handle.abort();
            if let Err(e) = cas_fail(&self.store, task_id, "shutdown").await {
                tracing::warn!(task_id, error = %e, "failed to mark task failed during shutdown");
            }
        }
    }

    /// Sweep `started` rows whose handler has gone silent for longer than
    /// twice its configured timeout back to `failed`. Run on a timer and
    /// once at startup to recover from a prior crash.
    pub async fn reap_orphaned(&self) -> Result<usize> {
        let filter = TaskFilter {
            statuses: Some(vec![TaskStatus::Started]),
            ..Default::default()
        };
        let started = self
            .store
            .list_tasks(&filter, Page { offset: 0, limit: 1024 })
            .await
            .context("failed to list started tasks for reaping")?;

        let now = Utc::now();
        let mut reaped = 0;
        for task in started {
            let Some(started_at) = task.started_at else {
                continue;
            };
            let timeout = self.config.timeout_for(&task.command);
            let stale_after = timeout * 2;
            if now - started_at > chrono::Duration::from_std(stale_after).unwrap_or_default() {
                let ok = cas_fail(&self.store, task.id, "orphaned")
                    .await
                    .with_context(|| format!("failed to reap task {}", task.id))?;
                if ok {
                    tracing::warn!(task_id = task.id, "reaped orphaned task");
                    reaped += 1;
                }
            }
        }

        Ok(reaped)
    }
}

/// Extracts a human-readable message from a caught panic payload.
fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// The CAS primitives below enforce the same transition graph a state
// machine would, but operate against the `TaskStore` trait object instead
// of a raw pool so the scheduler can be driven entirely by a fake store in
// tests.

async fn cas_start(store: &Arc<dyn TaskStore>, task_id: i64) -> anyhow::Result<bool> {
    store
        .update_task_status(
            task_id,
            &[TaskStatus::Queued],
            TaskStatus::Started,
            Some(Utc::now()),
            None,
            None,
            None,
            None,
        )
        .await
}

async fn cas_complete(
    store: &Arc<dyn TaskStore>,
    task_id: i64,
    result: serde_json::Value,
) -> anyhow::Result<bool> {
    let task = store
        .get_task(task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;
    let ended_at = Utc::now();
    let duration_ms = task.started_at.map(|s| (ended_at - s).num_milliseconds());
    store
        .update_task_status(
            task_id,
            &[TaskStatus::Started],
            TaskStatus::Completed,
            None,
            Some(ended_at),
            duration_ms,
            Some(result),
            None,
        )
        .await
}

async fn cas_fail(store: &Arc<dyn TaskStore>, task_id: i64, message: &str) -> anyhow::Result<bool> {
    let task = store
        .get_task(task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;
    let ended_at = Utc::now();
    let duration_ms = task.started_at.map(|s| (ended_at - s).num_milliseconds());
    store
        .update_task_status(
            task_id,
            &[TaskStatus::Started],
            TaskStatus::Failed,
            None,
            Some(ended_at),
            duration_ms,
            None,
            Some(message),
        )
        .await
}

async fn cas_abort_queued(store: &Arc<dyn TaskStore>, task_id: i64) -> anyhow::Result<bool> {
    store
        .update_task_status(
            task_id,
            &[TaskStatus::Queued],
            TaskStatus::Aborted,
            None,
            Some(Utc::now()),
            None,
            None,
            Some("cancelled before start"),
        )
        .await
}

async fn cas_begin_cancel(store: &Arc<dyn TaskStore>, task_id: i64) -> anyhow::Result<bool> {
    store
        .update_task_status(
            task_id,
            &[TaskStatus::Started],
            TaskStatus::Cancelling,
            None,
            None,
            None,
            None,
            None,
        )
        .await
}

async fn cas_finish_cancel(store: &Arc<dyn TaskStore>, task_id: i64) -> anyhow::Result<bool> {
    let task = store
        .get_task(task_id)
        .await?
        .with_context(|| format!("task {task_id} not found"))?;
    let ended_at = Utc::now();
    let duration_ms = task.started_at.map(|s| (ended_at - s).num_milliseconds());
    store
        .update_task_status(
            task_id,
            &[TaskStatus::Cancelling],
            TaskStatus::Aborted,
            None,
            Some(ended_at),
            duration_ms,
            None,
            None,
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        fn command(&self) -> &str {
            "Echo"
        }

        async fn execute(
            &self,
            ctx: &TaskContext,
            body: serde_json::Value,
        ) -> anyhow::Result<serde_json::Value> {
            ctx.report_progress(50, Some("halfway")).await;
            Ok(body)
        }
    }

    #[test]
    #[should_panic(expected = "duplicate handler registration")]
    fn registry_panics_on_duplicate_registration() {
        let mut registry = HandlerRegistry::new();
        registry.register_handler(EchoHandler);
        registry.register_handler(EchoHandler);
    }

    #[test]
    fn registry_get_returns_registered_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register_handler(EchoHandler);
        assert!(registry.get("Echo").is_some());
        assert!(registry.get("Missing").is_none());
    }

    #[tokio::test]
    async fn context_reports_cancellation() {
        let cancel = CancellationToken::new();
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        let child = cancel.clone();
        tokio::spawn(async move {
            child.cancelled().await;
            flag2.store(true, Ordering::SeqCst);
        });
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(flag.load(Ordering::SeqCst));
    }
}
