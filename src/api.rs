//! HTTP edge: submission and status API.
//!
//! Thin axum layer over the dispatcher. Submission is fire-and-forget:
//! a 202 with the job ID and a status-poll location. All real semantics
//! live in the dispatcher; this module only translates.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::Error;
use crate::model::{JobId, NewJob};

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/:id", get(job_status))
        .route("/jobs/:id/events", get(job_events))
        .route("/jobs/:id/callback", post(register_callback))
        .route("/callbacks/dead-letter", get(undelivered_callbacks))
        .with_state(engine)
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub job_type: String,
    pub job_id: Option<Uuid>,
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status_url: String,
}

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn submit_job(
    State(engine): State<Engine>,
    Json(req): Json<SubmitRequest>,
) -> Result<Response, ApiError> {
    let mut new = NewJob::new(req.job_type)
        .priority(req.priority)
        .payload(req.payload);
    if let Some(id) = req.job_id {
        new = new.id(JobId(id));
    }
    if let Some(key) = req.idempotency_key {
        new = new.idempotency_key(key);
    }
    for (key, value) in req.metadata {
        new = new.metadata(key, value);
    }
    if let Some(ms) = req.timeout_ms {
        new = new.timeout(Duration::from_millis(ms));
    }
    if let Some(n) = req.max_retries {
        new = new.max_retries(n);
    }

    let job_id = engine.dispatcher().submit(new).await?;
    let status_url = format!("/jobs/{}", job_id.0);

    let mut response = (
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job_id.0,
            status_url: status_url.clone(),
        }),
    )
        .into_response();
    if let Ok(location) = HeaderValue::from_str(&status_url) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    Ok(response)
}

async fn job_status(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let report = engine.dispatcher().status(JobId(id)).await?;
    Ok(Json(report).into_response())
}

async fn list_jobs(State(engine): State<Engine>) -> Response {
    Json(engine.dispatcher().list().await).into_response()
}

async fn job_events(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    // Distinguish unknown jobs from jobs with no events yet.
    engine.dispatcher().status(JobId(id)).await?;
    let events = engine.events().for_job(JobId(id)).await;
    Ok(Json(events).into_response())
}

#[derive(Debug, Deserialize)]
struct CallbackRequest {
    target: String,
}

async fn register_callback(
    State(engine): State<Engine>,
    Path(id): Path<Uuid>,
    Json(req): Json<CallbackRequest>,
) -> Result<StatusCode, ApiError> {
    engine
        .dispatcher()
        .register_callback(JobId(id), req.target)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn undelivered_callbacks(State(engine): State<Engine>) -> Response {
    let dead: Vec<serde_json::Value> = engine
        .dispatcher()
        .undelivered()
        .await
        .into_iter()
        .map(|u| {
            serde_json::json!({
                "target": u.target,
                "attempts": u.attempts,
                "notification": u.notification,
            })
        })
        .collect();
    Json(dead).into_response()
}
