use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::models::{ItemStatus, PublicationOutcome, ScheduledItem};
use crate::store;
use crate::tasks::TaskQueue;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub queue: TaskQueue,
    pub api_token: String,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks/{id}", get(task_status))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/items/{id}", get(item_details))
        .with_state(state)
}

#[derive(Deserialize)]
pub struct AuthQuery {
    token: Option<String>,
}

#[derive(Serialize)]
struct ItemView {
    id: String,
    status: ItemStatus,
    scheduled_time: DateTime<Utc>,
    generated_content: Option<String>,
    generated_image_file: Option<String>,
    error_message: Option<String>,
    requires_approval: bool,
    approved_by: Option<String>,
    approved_at: Option<DateTime<Utc>>,
    rejection_reason: Option<String>,
    outcomes: Vec<PublicationOutcome>,
}

impl ItemView {
    fn new(item: ScheduledItem, outcomes: Vec<PublicationOutcome>) -> Self {
        Self {
            id: item.id,
            status: item.status,
            scheduled_time: item.scheduled_time,
            generated_content: item.generated_content,
            generated_image_file: item.generated_image_file,
            error_message: item.error_message,
            requires_approval: item.requires_approval,
            approved_by: item.approved_by,
            approved_at: item.approved_at,
            rejection_reason: item.rejection_reason,
            outcomes,
        }
    }
}

async fn task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Response {
    if !authenticate(&state.api_token, &query, &headers) {
        return unauthorized();
    }
    match state.queue.status(&id).await {
        Ok(Some(status)) => Json(status).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("No task '{id}'")).into_response(),
        Err(e) => internal_error("failed to look up task", e),
    }
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Response {
    if !authenticate(&state.api_token, &query, &headers) {
        return unauthorized();
    }
    match state.queue.cancel(&id).await {
        Ok(Some(revoked)) => Json(json!({ "id": id, "revoked": revoked })).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("No task '{id}'")).into_response(),
        Err(e) => internal_error("failed to cancel task", e),
    }
}

async fn item_details(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Response {
    if !authenticate(&state.api_token, &query, &headers) {
        return unauthorized();
    }
    let item = match store::get_scheduled_item(&state.pool, &id).await {
        Ok(Some(item)) => item,
        Ok(None) => return (StatusCode::NOT_FOUND, format!("No item '{id}'")).into_response(),
        Err(e) => return internal_error("failed to look up item", e),
    };
    match store::get_outcomes_for_item(&state.pool, &id).await {
        Ok(outcomes) => Json(ItemView::new(item, outcomes)).into_response(),
        Err(e) => internal_error("failed to query outcomes", e),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer realm=\"pagecast\"")],
        "Unauthorized",
    )
        .into_response()
}

fn internal_error(what: &str, e: anyhow::Error) -> Response {
    warn!(error = %e, "{what}");
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal error").into_response()
}

fn authenticate(api_token: &str, query: &AuthQuery, headers: &HeaderMap) -> bool {
    if let Some(ref token) = query.token
        && constant_time_eq(token, api_token)
    {
        debug!("authenticated via query param");
        return true;
    }

    if let Some(auth_header) = headers.get(header::AUTHORIZATION)
        && let Ok(auth_str) = auth_header.to_str()
        && let Some(token) = auth_str.strip_prefix("Bearer ")
        && constant_time_eq(token.trim(), api_token)
    {
        debug!("authenticated via bearer token");
        return true;
    }

    false
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
