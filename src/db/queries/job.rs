//! Job store queries
//!
//! Per-job state transitions are guarded by WHERE clauses on the current
//! status, so concurrent writers serialize on the row.

use anyhow::Result;
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::{JobRecord, OptimizeJobRequest, OptimizeResult};

const JOB_COLUMNS: &str = "id, status, phase, progress, payload, result, \
     error_code, error_message, created_at, started_at, completed_at";

/// Persist a freshly submitted job in `queued` state
pub async fn insert_job(
    pool: &PgPool,
    id: Uuid,
    payload: &OptimizeJobRequest,
) -> Result<JobRecord> {
    let job = sqlx::query_as::<_, JobRecord>(&format!(
        r#"
        INSERT INTO jobs (id, status, phase, progress, payload, created_at)
        VALUES ($1, 'queued', 'starting', 0, $2, NOW())
        RETURNING {}
        "#,
        JOB_COLUMNS
    ))
    .bind(id)
    .bind(Json(payload))
    .fetch_one(pool)
    .await?;

    Ok(job)
}

/// Fetch a single job by id
pub async fn get_job(pool: &PgPool, id: Uuid) -> Result<Option<JobRecord>> {
    let job = sqlx::query_as::<_, JobRecord>(&format!(
        "SELECT {} FROM jobs WHERE id = $1",
        JOB_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(job)
}

/// Most recent jobs first
pub async fn list_jobs(pool: &PgPool, limit: i64) -> Result<Vec<JobRecord>> {
    let jobs = sqlx::query_as::<_, JobRecord>(&format!(
        "SELECT {} FROM jobs ORDER BY created_at DESC LIMIT $1",
        JOB_COLUMNS
    ))
    .bind(limit.clamp(1, 500))
    .fetch_all(pool)
    .await?;

    Ok(jobs)
}

/// queued → running. Returns false when the job was already dispatched,
/// cancelled, or unknown.
pub async fn mark_running(pool: &PgPool, id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'running', started_at = NOW()
        WHERE id = $1 AND status = 'queued'
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Update the visible phase and progress of a running job
pub async fn update_progress(pool: &PgPool, id: Uuid, phase: &str, progress: u8) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET phase = $2, progress = $3
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(id)
    .bind(phase)
    .bind(progress as i32)
    .execute(pool)
    .await?;

    Ok(())
}

/// running → completed with the result payload
pub async fn complete_job(pool: &PgPool, id: Uuid, result: &OptimizeResult) -> Result<bool> {
    let outcome = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'completed', phase = 'completed', progress = 100,
            result = $2, completed_at = NOW()
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(id)
    .bind(Json(result))
    .execute(pool)
    .await?;

    Ok(outcome.rows_affected() > 0)
}

/// queued/running → failed with an error code and message
pub async fn fail_job(pool: &PgPool, id: Uuid, code: &str, message: &str) -> Result<bool> {
    let outcome = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed', error_code = $2, error_message = $3,
            completed_at = NOW()
        WHERE id = $1 AND status IN ('queued', 'running')
        "#,
    )
    .bind(id)
    .bind(code)
    .bind(message)
    .execute(pool)
    .await?;

    Ok(outcome.rows_affected() > 0)
}

/// queued/running → cancelled. Idempotent: cancelling a terminal job
/// changes nothing and reports false.
pub async fn cancel_job(pool: &PgPool, id: Uuid) -> Result<bool> {
    let outcome = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'cancelled', error_code = 'CANCELLED',
            error_message = 'cancelled by user', completed_at = NOW()
        WHERE id = $1 AND status IN ('queued', 'running')
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(outcome.rows_affected() > 0)
}

/// Jobs left `running` by a dead worker are failed with INTERRUPTED at
/// startup. Returns the number of recovered rows.
pub async fn recover_interrupted(pool: &PgPool) -> Result<u64> {
    let outcome = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed', error_code = 'INTERRUPTED',
            error_message = 'worker died mid-job; resubmit to retry',
            completed_at = NOW()
        WHERE status = 'running'
        "#,
    )
    .execute(pool)
    .await?;

    Ok(outcome.rows_affected())
}
