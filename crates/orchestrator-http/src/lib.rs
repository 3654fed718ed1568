// crates/orchestrator-http/src/lib.rs
// ============================================================================
// Crate: orchestrator-http
// Description: axum router exposing the task/run CRUD and control surface.
// Purpose: Let an operator create tasks, inspect their state, approve/reject
//          a HUMAN_APPROVAL suspension, and kick the worker for one tick.
// Dependencies: orchestrator-core, orchestrator-handlers, orchestrator-worker, axum
// ============================================================================

//! ## Overview
//! Every handler opens at most one `Store::with_scope` call and returns
//! `TaskOut` — a `Task` together with its `Run`/`Artifact`/`Decision`
//! children, ordered ascending `id` per the data model. Errors are reported
//! as a `{"error": "<message>"}` JSON body with the status code named in
//! the specification's external-interfaces table.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use orchestrator_core::Artifact;
use orchestrator_core::CiWaiter;
use orchestrator_core::CodeHostingClient;
use orchestrator_core::Decision;
use orchestrator_core::DecisionValue;
use orchestrator_core::RoleDispatcher;
use orchestrator_core::Run;
use orchestrator_core::SecretScanner;
use orchestrator_core::Store;
use orchestrator_core::StoreError;
use orchestrator_core::Task;
use orchestrator_core::TaskId;
use orchestrator_handlers::HandlerDeps;
use orchestrator_worker::Scheduler;
use orchestrator_worker::TickSink;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;

// ============================================================================
// SECTION: Application State
// ============================================================================

/// Shared state handed to every route. Adapters are held behind `Arc<dyn _>`
/// so the state remains `Clone` (axum requires this for its router state)
/// without requiring any adapter to itself implement `Clone`.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn Store>,
    dispatcher: Arc<dyn RoleDispatcher>,
    code_hosting: Arc<dyn CodeHostingClient>,
    ci_waiter: Arc<dyn CiWaiter>,
    secret_scanner: Arc<dyn SecretScanner>,
    sink: Arc<dyn TickSink>,
    ci_timeout_seconds: u64,
    default_max_attempts: u32,
}

impl AppState {
    /// Bundles the store and external adapters backing the HTTP surface.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn RoleDispatcher>,
        code_hosting: Arc<dyn CodeHostingClient>,
        ci_waiter: Arc<dyn CiWaiter>,
        secret_scanner: Arc<dyn SecretScanner>,
        sink: Arc<dyn TickSink>,
        ci_timeout_seconds: u64,
        default_max_attempts: u32,
    ) -> Self {
        Self { store, dispatcher, code_hosting, ci_waiter, secret_scanner, sink, ci_timeout_seconds, default_max_attempts }
    }

    fn handler_deps(&self) -> HandlerDeps<'_> {
        HandlerDeps {
            dispatcher: self.dispatcher.as_ref(),
            code_hosting: self.code_hosting.as_ref(),
            ci_waiter: self.ci_waiter.as_ref(),
            secret_scanner: self.secret_scanner.as_ref(),
            ci_timeout_seconds: self.ci_timeout_seconds,
        }
    }
}

/// Builds the router exposing the six endpoints of the specification's
/// external-interfaces table.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", post(create_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/approve", post(approve_task))
        .route("/tasks/{id}/reject", post(reject_task))
        .route("/tasks/{id}/kick", post(kick_task))
        .route("/health", get(health))
        .with_state(state)
}

// ============================================================================
// SECTION: Wire Types
// ============================================================================

/// Request body for `POST /tasks`.
#[derive(Debug, Deserialize)]
struct CreateTaskRequest {
    title: String,
    raw_request: String,
}

/// Request body for `POST /tasks/{id}/approve`.
#[derive(Debug, Deserialize, Default)]
struct ApproveRequest {
    comment: Option<String>,
}

/// Request body for `POST /tasks/{id}/reject`.
#[derive(Debug, Deserialize, Default)]
struct RejectRequest {
    comment: Option<String>,
}

/// A task together with its runs, artifacts, and decisions, ascending `id`.
#[derive(Debug, Serialize)]
struct TaskOut {
    task: Task,
    runs: Vec<Run>,
    artifacts: Vec<Artifact>,
    decisions: Vec<Decision>,
}

impl From<orchestrator_core::TaskWithChildren> for TaskOut {
    fn from(value: orchestrator_core::TaskWithChildren) -> Self {
        Self { task: value.task, runs: value.runs, artifacts: value.artifacts, decisions: value.decisions }
    }
}

/// `{"error": "<message>"}` response body shared by every failure path.
fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn store_error_response(err: &StoreError) -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

// ============================================================================
// SECTION: Handlers
// ============================================================================

async fn create_task(State(state): State<AppState>, Json(body): Json<CreateTaskRequest>) -> Response {
    let mut created: Option<Task> = None;
    let result = state.store.with_scope(&mut |scope| {
        created = Some(scope.create_task(&body.title, &body.raw_request, state.default_max_attempts)?);
        Ok(())
    });
    if let Err(err) = result {
        return store_error_response(&err);
    }
    let Some(task) = created else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "task create produced no task");
    };
    respond_with_task(&state, task.id, StatusCode::CREATED).await
}

async fn get_task(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    let Some(task_id) = parse_task_id(id) else {
        return error_response(StatusCode::NOT_FOUND, "task not found");
    };
    respond_with_task(&state, task_id, StatusCode::OK).await
}

async fn approve_task(State(state): State<AppState>, Path(id): Path<i64>, body: Option<Json<ApproveRequest>>) -> Response {
    let Some(task_id) = parse_task_id(id) else {
        return error_response(StatusCode::NOT_FOUND, "task not found");
    };
    let comment = body.map(|Json(request)| request).unwrap_or_default().comment;
    let mut missing = false;
    let result = state.store.with_scope(&mut |scope| {
        if scope.get_task(task_id)?.is_none() {
            missing = true;
            return Ok(());
        }
        scope.insert_decision(task_id, DecisionValue::Approve, comment.clone())?;
        Ok(())
    });
    if let Err(err) = result {
        return store_error_response(&err);
    }
    if missing {
        return error_response(StatusCode::NOT_FOUND, "task not found");
    }
    respond_with_task(&state, task_id, StatusCode::OK).await
}

async fn reject_task(State(state): State<AppState>, Path(id): Path<i64>, body: Option<Json<RejectRequest>>) -> Response {
    let Some(task_id) = parse_task_id(id) else {
        return error_response(StatusCode::NOT_FOUND, "task not found");
    };
    let comment = body.map(|Json(request)| request).unwrap_or_default().comment;
    let Some(comment) = comment.filter(|value| !value.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "comment is required to reject a task");
    };
    let mut missing = false;
    let result = state.store.with_scope(&mut |scope| {
        if scope.get_task(task_id)?.is_none() {
            missing = true;
            return Ok(());
        }
        scope.insert_decision(task_id, DecisionValue::Reject, Some(comment.clone()))?;
        scope.set_task_status(task_id, orchestrator_core::TaskStatus::Failed)?;
        Ok(())
    });
    if let Err(err) = result {
        return store_error_response(&err);
    }
    if missing {
        return error_response(StatusCode::NOT_FOUND, "task not found");
    }
    respond_with_task(&state, task_id, StatusCode::OK).await
}

async fn kick_task(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    if parse_task_id(id).is_none() {
        return error_response(StatusCode::NOT_FOUND, "task not found");
    }
    let scheduler = Scheduler::new(state.store.as_ref(), state.default_max_attempts, state.sink.as_ref());
    match scheduler.run_once(&state.handler_deps()) {
        Ok(outcome) => Json(json!({ "status": outcome.as_kick_status() })).into_response(),
        Err(err) => store_error_response(&err),
    }
}

async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn respond_with_task(state: &AppState, task_id: TaskId, ok_status: StatusCode) -> Response {
    match state.store.get_task_with_children(task_id) {
        Ok(Some(with_children)) => (ok_status, Json(TaskOut::from(with_children))).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "task not found"),
        Err(err) => store_error_response(&err),
    }
}

fn parse_task_id(raw: i64) -> Option<TaskId> {
    TaskId::from_raw(raw)
}
