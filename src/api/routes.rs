//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::{ErrorKind, SchedulerError};
use crate::model::{RunStatus, ScheduleJob};
use crate::service::JobPatch;

use super::correlation_id;
use super::state::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/job", post(add_job).patch(patch_job))
        .route("/job/all", get(all_jobs))
        .route(
            "/job/name/{name}",
            get(job_by_name).delete(delete_job_by_name),
        )
        .route("/trigger/job/name/{name}", post(trigger_job_by_name))
        .route("/record/all", get(all_records))
        .route("/record/status/{status}", get(records_by_status))
        .route("/record/job/name/{name}", get(records_by_job))
        .route(
            "/record/job/name/{name}/status/{status}",
            get(records_by_job_and_status),
        )
        .route("/record/latest/all", get(latest_records))
        .route("/record/latest/job/name/{name}", get(latest_records_by_job))
        .route("/record/age/{age}", delete(delete_records_by_age))
}

/// Handler error: a scheduler error plus the correlation id it happened
/// under. The kind-to-status mapping lives here and nowhere else.
struct ApiError {
    error: SchedulerError,
    correlation_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.error.kind() {
            ErrorKind::ContractInvalid => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Server | ErrorKind::Database => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": self.error.to_string(),
            "meta": { "correlation_id": self.correlation_id }
        });
        (status, Json(body)).into_response()
    }
}

fn wrap<T>(result: crate::errors::Result<T>, corr: &str) -> Result<T, ApiError> {
    result.map_err(|error| ApiError {
        error,
        correlation_id: corr.to_string(),
    })
}

fn envelope(data: Value, corr: &str) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": { "correlation_id": corr }
    }))
}

fn paged(data: Value, total: u64, corr: &str) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": { "total": total, "correlation_id": corr }
    }))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn add_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(job): Json<ScheduleJob>,
) -> Result<impl IntoResponse, ApiError> {
    let corr = correlation_id(&headers);
    let stored = wrap(state.service.add_job(job, &corr).await, &corr)?;
    Ok((
        StatusCode::CREATED,
        envelope(json!(stored), &corr),
    ))
}

async fn patch_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(patch): Json<JobPatch>,
) -> Result<Json<Value>, ApiError> {
    let corr = correlation_id(&headers);
    let stored = wrap(state.service.patch_job(patch, &corr).await, &corr)?;
    Ok(envelope(json!(stored), &corr))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JobQuery {
    /// Comma-separated label filter; a job must carry every label.
    labels: String,
    offset: usize,
    limit: Option<usize>,
}

const DEFAULT_PAGE_LIMIT: usize = 20;

async fn all_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<JobQuery>,
) -> Result<Json<Value>, ApiError> {
    let corr = correlation_id(&headers);
    let labels: Vec<String> = query
        .labels
        .split(',')
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let (jobs, total) = wrap(state.service.all_jobs(&labels, query.offset, limit), &corr)?;
    Ok(paged(json!(jobs), total, &corr))
}

async fn job_by_name(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let corr = correlation_id(&headers);
    let job = wrap(state.service.job_by_name(&name), &corr)?;
    Ok(envelope(json!(job), &corr))
}

async fn delete_job_by_name(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let corr = correlation_id(&headers);
    wrap(state.service.delete_job_by_name(&name, &corr).await, &corr)?;
    Ok(envelope(json!({ "name": name }), &corr))
}

async fn trigger_job_by_name(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let corr = correlation_id(&headers);
    wrap(state.service.trigger_job_by_name(&name, &corr).await, &corr)?;
    Ok((StatusCode::ACCEPTED, envelope(json!({ "name": name }), &corr)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RecordQuery {
    /// Epoch-ms window on the persistence timestamp; 0 means unbounded.
    start: i64,
    end: i64,
    offset: usize,
    limit: Option<usize>,
}

fn parse_status(raw: &str, corr: &str) -> Result<RunStatus, ApiError> {
    raw.parse::<RunStatus>().map_err(|e| ApiError {
        error: SchedulerError::ContractInvalid(e),
        correlation_id: corr.to_string(),
    })
}

async fn all_records(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<RecordQuery>,
) -> Result<Json<Value>, ApiError> {
    let corr = correlation_id(&headers);
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let (records, total) = wrap(
        state.service.all_records(q.start, q.end, q.offset, limit),
        &corr,
    )?;
    Ok(paged(json!(records), total, &corr))
}

async fn records_by_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(status): Path<String>,
    Query(q): Query<RecordQuery>,
) -> Result<Json<Value>, ApiError> {
    let corr = correlation_id(&headers);
    let status = parse_status(&status, &corr)?;
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let (records, total) = wrap(
        state
            .service
            .records_by_status(status, q.start, q.end, q.offset, limit),
        &corr,
    )?;
    Ok(paged(json!(records), total, &corr))
}

async fn records_by_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Query(q): Query<RecordQuery>,
) -> Result<Json<Value>, ApiError> {
    let corr = correlation_id(&headers);
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let (records, total) = wrap(
        state
            .service
            .records_by_job_name(&name, q.start, q.end, q.offset, limit),
        &corr,
    )?;
    Ok(paged(json!(records), total, &corr))
}

async fn records_by_job_and_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((name, status)): Path<(String, String)>,
    Query(q): Query<RecordQuery>,
) -> Result<Json<Value>, ApiError> {
    let corr = correlation_id(&headers);
    let status = parse_status(&status, &corr)?;
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let (records, total) = wrap(
        state
            .service
            .records_by_job_and_status(&name, status, q.start, q.end, q.offset, limit),
        &corr,
    )?;
    Ok(paged(json!(records), total, &corr))
}

async fn latest_records(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<RecordQuery>,
) -> Result<Json<Value>, ApiError> {
    let corr = correlation_id(&headers);
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let records = wrap(state.service.latest_records(q.offset, limit), &corr)?;
    Ok(envelope(json!(records), &corr))
}

async fn latest_records_by_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let corr = correlation_id(&headers);
    let records = wrap(state.service.latest_records_by_job_name(&name), &corr)?;
    Ok(envelope(json!(records), &corr))
}

async fn delete_records_by_age(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(age): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let corr = correlation_id(&headers);
    let deleted = wrap(state.service.delete_records_by_age(age, &corr), &corr)?;
    Ok(envelope(json!({ "deleted": deleted }), &corr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke::test_support::test_clients;
    use crate::manager::SchedulerManager;
    use crate::service::Service;
    use crate::storage;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let pool = storage::open_pool(path.to_str().unwrap()).unwrap();
        let (clients, _, _) = test_clients();
        let manager = Arc::new(SchedulerManager::new(clients, pool.clone()));
        let state = AppState {
            service: Service::new(manager, pool),
        };
        (dir, crate::api::router(state))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn job_body(name: &str) -> String {
        json!({
            "name": name,
            "definition": { "type": "INTERVAL", "interval": "1h" },
            "actions": [
                { "type": "REST", "address": "http://edge/ping", "method": "GET" }
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_health_reports_ok() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_job_create_fetch_delete_round_trip() {
        let (_dir, app) = test_app();

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/v1/job")
                    .header("content-type", "application/json")
                    .header("X-Correlation-ID", "corr-rt")
                    .body(Body::from(job_body("rt")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["data"]["name"], "rt");
        assert_eq!(body["meta"]["correlation_id"], "corr-rt");

        let response = app
            .clone()
            .oneshot(
                Request::get("/api/v1/job/name/rt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::delete("/api/v1/job/name/rt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::get("/api/v1/job/name/rt")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_duplicate_job_is_conflict() {
        let (_dir, app) = test_app();
        for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
            let response = app
                .clone()
                .oneshot(
                    Request::post("/api/v1/job")
                        .header("content-type", "application/json")
                        .body(Body::from(job_body("dup")))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn test_bad_definition_is_bad_request() {
        let (_dir, app) = test_app();
        let body = json!({
            "name": "bad",
            "definition": { "type": "INTERVAL", "interval": "never" },
            "actions": [
                { "type": "REST", "address": "http://edge/ping", "method": "GET" }
            ]
        })
        .to_string();
        let response = app
            .oneshot(
                Request::post("/api/v1/job")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_status_segment_is_bad_request() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(
                Request::get("/api/v1/record/status/SORTA")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_trigger_unknown_job_is_not_found() {
        let (_dir, app) = test_app();
        let response = app
            .oneshot(
                Request::post("/api/v1/trigger/job/name/ghost")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
