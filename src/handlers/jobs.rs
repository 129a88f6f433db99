//! Job endpoints: submit, read, result, cancel

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use super::AppState;
use crate::services::jobs::ResultOutcome;
use crate::types::{JobError, OptimizeJobRequest};

/// Wire shape for error responses
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

/// Maps the job error taxonomy onto HTTP statuses
pub struct ApiError(pub StatusCode, pub ErrorBody);

impl ApiError {
    fn from_job_error(e: JobError) -> Self {
        let status = match &e {
            JobError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            JobError::Infeasible(_) => StatusCode::UNPROCESSABLE_ENTITY,
            JobError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            JobError::Cancelled => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %e, "internal error on job endpoint");
        }
        ApiError(status, ErrorBody::new(e.code(), e.to_string()))
    }

    fn not_found(id: Uuid) -> Self {
        ApiError(
            StatusCode::NOT_FOUND,
            ErrorBody::new("JOB_NOT_FOUND", format!("job {} not found", id)),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

/// POST /optimize-async
pub async fn submit(
    State(state): State<AppState>,
    Json(mut request): Json<OptimizeJobRequest>,
) -> Result<Response, ApiError> {
    request.options = state.config.effective_options(request.options);
    let response = state
        .manager
        .submit(request)
        .await
        .map_err(ApiError::from_job_error)?;
    Ok((StatusCode::ACCEPTED, Json(response)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// GET /jobs
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let jobs = state
        .manager
        .list(params.limit)
        .await
        .map_err(ApiError::from_job_error)?;
    Ok(Json(jobs).into_response())
}

/// GET /jobs/{id}
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let view = state
        .manager
        .get(id)
        .await
        .map_err(ApiError::from_job_error)?
        .ok_or_else(|| ApiError::not_found(id))?;
    Ok(Json(view).into_response())
}

/// GET /jobs/{id}/result — 409 until the job is completed
pub async fn result(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    match state
        .manager
        .result(id)
        .await
        .map_err(ApiError::from_job_error)?
    {
        ResultOutcome::NotFound => Err(ApiError::not_found(id)),
        ResultOutcome::NotReady(status) => Err(ApiError(
            StatusCode::CONFLICT,
            ErrorBody::new(
                "NOT_COMPLETED",
                format!("job is {}, result not available", status.as_str()),
            ),
        )),
        ResultOutcome::Ready(result) => Ok(Json(*result).into_response()),
    }
}

/// DELETE /jobs/{id}
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let view = state
        .manager
        .cancel(id)
        .await
        .map_err(ApiError::from_job_error)?
        .ok_or_else(|| ApiError::not_found(id))?;
    Ok(Json(view).into_response())
}
