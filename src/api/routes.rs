//! API route definitions.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::state::AppState;
use crate::fix;
use crate::monitor::MonitorEvent;
use crate::storage::{self, Pool};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/issues", get(list_issues))
        .route("/fix-attempts", get(list_fix_attempts))
        .route("/transitions", get(list_transitions))
        .route("/fix", post(submit_fix))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn error(status: StatusCode, message: String) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "data": null, "meta": { "error": message } })))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.snapshots.borrow().clone();
    Json(json!({ "data": snapshot, "meta": meta() }))
}

/// Run a storage listing on the blocking pool.
async fn list<T, F>(pool: Pool, limit: usize, query: F) -> (StatusCode, Json<Value>)
where
    T: Serialize + Send + 'static,
    F: FnOnce(&Pool, usize) -> anyhow::Result<Vec<T>> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || query(&pool, limit)).await {
        Ok(Ok(rows)) => (
            StatusCode::OK,
            Json(json!({
                "data": rows,
                "meta": { "total": rows.len(), "limit": limit }
            })),
        ),
        Ok(Err(e)) => error(StatusCode::INTERNAL_SERVER_ERROR, format!("database error: {}", e)),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, format!("query task failed: {}", e)),
    }
}

async fn list_issues(State(state): State<AppState>, Query(q): Query<ListQuery>) -> (StatusCode, Json<Value>) {
    list(state.pool.clone(), q.limit(), storage::list_recent_issues).await
}

async fn list_fix_attempts(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> (StatusCode, Json<Value>) {
    list(state.pool.clone(), q.limit(), storage::list_fix_attempts).await
}

async fn list_transitions(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> (StatusCode, Json<Value>) {
    list(state.pool.clone(), q.limit(), storage::list_transitions).await
}

/// Same path as a dropped fix file: the descriptor joins the control loop's
/// inbox and is applied only if its focus group is paused.
async fn submit_fix(State(state): State<AppState>, body: String) -> (StatusCode, Json<Value>) {
    let descriptor = match fix::parse_descriptor(&body) {
        Ok(d) => d,
        Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let focus_group_id = descriptor.focus_group_id;

    if state.events.send(MonitorEvent::Fix(descriptor)).await.is_err() {
        return error(StatusCode::SERVICE_UNAVAILABLE, "monitor is shutting down".to_string());
    }
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "data": { "accepted": true, "focusGroupId": focus_group_id },
            "meta": meta()
        })),
    )
}
