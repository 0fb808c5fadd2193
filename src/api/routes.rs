use crate::catalog::Catalog;
use crate::config::Config;
use crate::deriver::{self, ChecklistStatus};
use crate::store::{SubmissionHub, SubmissionInput, SubmissionStore};
use crate::trends::{TrendError, TrendReport, fetch_trends};
use anyhow::Context;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub hub: Arc<SubmissionHub>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/status", get(status))
        .route("/api/v1/checklists", get(checklists))
        .route("/api/v1/trends", get(trends))
        .route("/api/v1/submissions", post(submit))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TrendsQuery {
    weeks: Option<u32>,
}

#[derive(Debug, Serialize)]
struct StatusPayload {
    api_port: u16,
    catalog_entries: usize,
    submission_count: i64,
    last_submitted_at: Option<NaiveDateTime>,
}

#[derive(Debug, Serialize)]
struct ChecklistsPayload {
    computed_at: NaiveDateTime,
    checklists: Vec<ChecklistStatus>,
}

async fn status(State(state): State<ApiState>) -> ApiResult<Json<StatusPayload>> {
    let store = SubmissionStore::open(&state.config.db_path)?;

    let payload = StatusPayload {
        api_port: state.config.api_port,
        catalog_entries: state.catalog.len(),
        submission_count: store.submission_count()?,
        last_submitted_at: store.latest_submission_at()?,
    };

    Ok(Json(payload))
}

async fn checklists(State(state): State<ApiState>) -> ApiResult<Json<ChecklistsPayload>> {
    let now = Local::now().naive_local();
    let store = SubmissionStore::open(&state.config.db_path)?;
    let submissions = store.submissions_for_date(now.date())?;

    Ok(Json(ChecklistsPayload {
        computed_at: now,
        checklists: deriver::derive(&state.catalog, &submissions, now),
    }))
}

async fn trends(
    State(state): State<ApiState>,
    Query(query): Query<TrendsQuery>,
) -> ApiResult<Json<TrendReport>> {
    let weeks = query.weeks.unwrap_or(state.config.trend_weeks).clamp(1, 52);

    let report = fetch_trends(
        &state.config.db_path,
        &state.catalog,
        weeks,
        state.config.trend_timeout(),
        state.config.missed_task_limit,
    )
    .await?;

    Ok(Json(report))
}

async fn submit(
    State(state): State<ApiState>,
    Json(input): Json<SubmissionInput>,
) -> ApiResult<Json<serde_json::Value>> {
    let submitted_at = Local::now().naive_local();
    let submission = state
        .hub
        .record(&input, submitted_at)
        .context("Failed to record submission")?;

    Ok(Json(json!({
        "saved": true,
        "id": submission.id,
        "submitted_at": submission.submitted_at
    })))
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug)]
enum ApiError {
    Timeout(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value)
    }
}

impl From<TrendError> for ApiError {
    fn from(value: TrendError) -> Self {
        match value {
            TrendError::Timeout(_) => Self::Timeout(value.to_string()),
            TrendError::Query { .. } => Self::Internal(value.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Timeout(message) => {
                (StatusCode::GATEWAY_TIMEOUT, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Internal(error) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": error.to_string() })),
            )
                .into_response(),
        }
    }
}
