//! The single job-processing entry point.

use axum::{extract::State, Json};
use serde_json::{json, Value};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

/// `POST /run` — one job per invocation, platform envelope
/// `{"input": {...}}`. The job outcome, success or structured failure,
/// always travels inside the `output` field.
pub async fn run(
    State(state): State<AppState>,
    Json(event): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let job_id = event
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let input = event
        .get("input")
        .cloned()
        .ok_or_else(|| ApiError::bad_request("event is missing the 'input' object"))?;

    let _permit = state
        .job_semaphore
        .acquire()
        .await
        .map_err(|_| ApiError::unavailable("worker is shutting down"))?;

    info!(job_id = %job_id, "processing job");
    let output = state.runner.run(&input).await;

    Ok(Json(json!({
        "id": job_id,
        "output": output,
    })))
}
