use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use core_db::models::{Priority, Task, Trigger};
use core_db::queries::scheduled::ScheduledTaskFields;
use core_db::queries::tasks::{NewTask, Page, TaskFilter};

use core_engine::error::CoreError;
use core_engine::scheduler::{CancelOutcome, Scheduler};
use core_engine::store::TaskStore;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        let status = match &err {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            CoreError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::HandlerTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CoreError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::HandlerError(_) | CoreError::ProgrammerError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<dyn TaskStore>,
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub deadline_ms: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub id: i64,
    pub reused: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct CancelTaskResponse {
    pub outcome: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct UpsertScheduledRequest {
    pub command: String,
    #[serde(default)]
    pub body: serde_json::Value,
    pub interval_ms: i64,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
pub struct MetricsQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct HealthDashboardResponse {
    pub unresolved_issues: usize,
    pub critical: usize,
    pub warning: usize,
    pub error: usize,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/tasks", post(submit_task).get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/queue", get(list_queue))
        .route(
            "/api/scheduled",
            get(list_scheduled_handler),
        )
        .route(
            "/api/scheduled/{name}",
            put(upsert_scheduled_handler).delete(delete_scheduled_handler),
        )
        .route("/api/health", get(list_health_issues))
        .route("/api/health/dashboard", get(health_dashboard))
        .route("/api/health/issues/{id}/dismiss", post(dismiss_issue_handler))
        .route("/api/health/issues/{id}/resolve", post(resolve_issue_handler))
        .route("/api/metrics", get(list_metrics_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("taskd serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("taskd serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn index() -> impl IntoResponse {
    Html(
        "<!DOCTYPE html>\
<html><head><title>taskd</title></head><body>\
<h1>taskd</h1>\
<p><a href=\"/api/tasks\">/api/tasks</a> | <a href=\"/api/queue\">/api/queue</a> | \
<a href=\"/api/scheduled\">/api/scheduled</a> | <a href=\"/api/health\">/api/health</a> | \
<a href=\"/api/health/dashboard\">/api/health/dashboard</a> | <a href=\"/api/metrics\">/api/metrics</a></p>\
</body></html>",
    )
}

async fn submit_task(
    State(state): State<AppState>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<Json<SubmitTaskResponse>, AppError> {
    let outcome = state
        .scheduler
        .submit(NewTask {
            name: &req.name,
            command: &req.command,
            body: req.body,
            priority: req.priority,
            trigger: Trigger::Manual,
            deadline_ms: req.deadline_ms,
            scheduled_task_name: None,
        })
        .await?;

    Ok(Json(SubmitTaskResponse {
        id: outcome.task_id,
        reused: outcome.reused,
    }))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Task>, AppError> {
    let task = state.scheduler.get_task(id).await?;
    Ok(Json(task))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<Json<Vec<Task>>, AppError> {
    let statuses = match query.status {
        Some(s) => Some(vec![s.parse().map_err(|_| {
            AppError::from(CoreError::InvalidArgument(format!("invalid status {s}")))
        })?]),
        None => None,
    };

    let filter = TaskFilter {
        statuses,
        command: query.command,
        ..Default::default()
    };
    let page = Page {
        offset: query.offset,
        limit: query.limit,
    };

    let tasks = state.scheduler.list(&filter, page).await?;
    Ok(Json(tasks))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<CancelTaskResponse>, AppError> {
    let outcome = state.scheduler.cancel(id).await?;
    let outcome = match outcome {
        CancelOutcome::Cancelled => "cancelled",
        CancelOutcome::AlreadyTerminal => "already_terminal",
        CancelOutcome::NotFound => return Err(AppError::not_found(format!("task {id} not found"))),
    };
    Ok(Json(CancelTaskResponse { outcome }))
}

async fn list_queue(State(state): State<AppState>) -> Result<Json<Vec<Task>>, AppError> {
    let filter = TaskFilter {
        statuses: Some(vec![core_db::models::TaskStatus::Queued]),
        ..Default::default()
    };
    let tasks = state
        .scheduler
        .list(&filter, Page { offset: 0, limit: 256 })
        .await?;
    Ok(Json(tasks))
}

async fn list_scheduled_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<core_db::models::ScheduledTask>>, AppError> {
    let scheduled = state.store.list_scheduled().await.map_err(AppError::internal)?;
    Ok(Json(scheduled))
}

async fn upsert_scheduled_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<UpsertScheduledRequest>,
) -> Result<Json<core_db::models::ScheduledTask>, AppError> {
    let scheduled = state
        .store
        .upsert_scheduled(
            &name,
            ScheduledTaskFields {
                command: &req.command,
                body: req.body,
                interval_ms: req.interval_ms,
                priority: req.priority,
                enabled: req.enabled,
            },
        )
        .await
        .map_err(AppError::internal)?;
    Ok(Json(scheduled))
}

async fn delete_scheduled_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    let deleted = state.store.delete_scheduled(&name).await.map_err(AppError::internal)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("scheduled task {name} not found")))
    }
}

async fn list_health_issues(
    State(state): State<AppState>,
) -> Result<Json<Vec<core_db::models::HealthIssue>>, AppError> {
    let issues = state.store.list_issues(true).await.map_err(AppError::internal)?;
    Ok(Json(issues))
}

async fn health_dashboard(
    State(state): State<AppState>,
) -> Result<Json<HealthDashboardResponse>, AppError> {
    let issues = state.store.list_issues(true).await.map_err(AppError::internal)?;

    let mut critical = 0;
    let mut warning = 0;
    let mut error = 0;
    for issue in &issues {
        match issue.severity {
            core_db::models::Severity::Critical => critical += 1,
            core_db::models::Severity::Warning => warning += 1,
            core_db::models::Severity::Error => error += 1,
            core_db::models::Severity::Info => {}
        }
    }

    Ok(Json(HealthDashboardResponse {
        unresolved_issues: issues.len(),
        critical,
        warning,
        error,
    }))
}

async fn dismiss_issue_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let ok = state.store.dismiss_issue(id).await.map_err(AppError::internal)?;
    if ok {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("issue {id} not found")))
    }
}

async fn resolve_issue_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let ok = state.store.resolve_issue(id).await.map_err(AppError::internal)?;
    if ok {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("issue {id} not found")))
    }
}

async fn list_metrics_handler(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<Vec<core_db::models::PerformanceMetric>>, AppError> {
    let until = query.until.unwrap_or_else(Utc::now);
    let since = query.since.unwrap_or_else(|| until - chrono::Duration::days(1));
    let metrics = state
        .store
        .list_metrics(since, until)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(metrics))
}

#[allow(dead_code)]
fn default_await_timeout() -> Duration {
    Duration::from_secs(30)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::ServiceExt;

    use core_engine::config::CoreConfig;
    use core_engine::pool::WorkerPoolSet;
    use core_engine::scheduler::{HandlerRegistry, TaskHandler};
    use core_engine::store::PgTaskStore;
    use core_test_utils::{create_test_db, drop_test_db};

    struct NoopHandler;

    #[async_trait::async_trait]
    impl TaskHandler for NoopHandler {
        fn command(&self) -> &str {
            "Noop"
        }

        async fn execute(
            &self,
            _ctx: &core_engine::scheduler::TaskContext,
            body: serde_json::Value,
        ) -> anyhow::Result<serde_json::Value> {
            Ok(body)
        }
    }

    async fn build_state(pool: sqlx::PgPool) -> AppState {
        let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool));
        let mut registry = HandlerRegistry::new();
        registry.register_handler(NoopHandler);

        let mut configured = HashMap::new();
        configured.insert("default".to_string(), 3);
        configured.insert("high-priority".to_string(), 2);
        configured.insert("background".to_string(), 1);
        let pools = WorkerPoolSet::bootstrap(&store, &configured).await.unwrap();

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::new(registry),
            Arc::new(pools),
            Arc::new(CoreConfig::default()),
        ));

        AppState { scheduler, store }
    }

    async fn send_request(state: AppState, req: Request<Body>) -> axum::response::Response {
        let app = super::build_router(state);
        app.oneshot(req).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn index_returns_html() {
        let (pool, db_name) = create_test_db().await;
        let state = build_state(pool.clone()).await;

        let resp = send_request(state, Request::builder().uri("/").body(Body::empty()).unwrap()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn submit_and_get_task_roundtrip() {
        let (pool, db_name) = create_test_db().await;
        let state = build_state(pool.clone()).await;

        let submit_req = Request::builder()
            .method("POST")
            .uri("/api/tasks")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"name": "RefreshMovie", "command": "Noop", "body": {}}).to_string(),
            ))
            .unwrap();
        let resp = send_request(state.clone(), submit_req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        let id = json["id"].as_i64().unwrap();
        assert_eq!(json["reused"], false);

        let get_req = Request::builder()
            .uri(format!("/api/tasks/{id}"))
            .body(Body::empty())
            .unwrap();
        let resp = send_request(state, get_req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["id"], id);
        assert_eq!(json["status"], "queued");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn get_missing_task_returns_404() {
        let (pool, db_name) = create_test_db().await;
        let state = build_state(pool.clone()).await;

        let resp = send_request(
            state,
            Request::builder().uri("/api/tasks/999999").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn cancel_queued_task_succeeds() {
        let (pool, db_name) = create_test_db().await;
        let state = build_state(pool.clone()).await;

        let submit_req = Request::builder()
            .method("POST")
            .uri("/api/tasks")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"name": "RefreshMovie", "command": "Noop", "body": {}}).to_string(),
            ))
            .unwrap();
        let resp = send_request(state.clone(), submit_req).await;
        let json = body_json(resp).await;
        let id = json["id"].as_i64().unwrap();

        let cancel_req = Request::builder()
            .method("POST")
            .uri(format!("/api/tasks/{id}/cancel"))
            .body(Body::empty())
            .unwrap();
        let resp = send_request(state, cancel_req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["outcome"], "cancelled");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn health_dashboard_starts_empty() {
        let (pool, db_name) = create_test_db().await;
        let state = build_state(pool.clone()).await;

        let resp = send_request(
            state,
            Request::builder().uri("/api/health/dashboard").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["unresolved_issues"], 0);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
