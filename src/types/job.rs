//! Optimization job records and wire types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::options::{OptimizerOptions, PerturbationDistribution};
use super::route::Route;
use super::schedule::DaySchedule;

/// Lifecycle state of a job: queued → running → (completed | failed |
/// cancelled); queued → cancelled is allowed pre-dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<JobState> {
        match s {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "completed" => Some(JobState::Completed),
            "cancelled" => Some(JobState::Cancelled),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed
        )
    }
}

/// Failure taxonomy surfaced on the job record and over the wire
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("no feasible schedule: {0}")]
    Infeasible(String),
    #[error("travel-time provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("job exceeded its time budget")]
    Timeout,
    #[error("job cancelled by user")]
    Cancelled,
    #[error("worker interrupted mid-job")]
    Interrupted,
    #[error("internal error [{correlation_id}]: {message}")]
    Internal {
        message: String,
        correlation_id: Uuid,
    },
}

impl JobError {
    pub fn internal(message: impl Into<String>) -> Self {
        JobError::Internal {
            message: message.into(),
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Stable wire code for this failure
    pub fn code(&self) -> &'static str {
        match self {
            JobError::InvalidInput(_) => "INVALID_INPUT",
            JobError::Infeasible(_) => "INFEASIBLE",
            JobError::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            JobError::Timeout => "TIMEOUT",
            JobError::Cancelled => "CANCELLED",
            JobError::Interrupted => "INTERRUPTED",
            JobError::Internal { .. } => "INTERNAL",
        }
    }

    /// Transient failures are retried with exponential backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::ProviderUnavailable(_))
    }
}

/// Robustness grade thresholds over the feasibility rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RobustnessGrade {
    A,
    B,
    C,
    D,
    F,
}

impl RobustnessGrade {
    pub fn from_rate(rate: f64) -> Self {
        if rate >= 0.95 {
            RobustnessGrade::A
        } else if rate >= 0.85 {
            RobustnessGrade::B
        } else if rate >= 0.70 {
            RobustnessGrade::C
        } else if rate >= 0.50 {
            RobustnessGrade::D
        } else {
            RobustnessGrade::F
        }
    }

    pub fn recommendation(&self) -> &'static str {
        match self {
            RobustnessGrade::A => "Schedule is robust; safe to operate as planned.",
            RobustnessGrade::B => "Schedule is mostly robust; review the tightest transitions.",
            RobustnessGrade::C => "Schedule is sensitive to delays; add slack on flagged transitions.",
            RobustnessGrade::D => "Schedule is fragile; increase buffers or reduce chaining.",
            RobustnessGrade::F => "Schedule is not operable under uncertainty; re-optimize with larger buffers.",
        }
    }
}

/// Outcome of the Monte Carlo validator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonteCarloResult {
    pub simulations: u32,
    pub distribution: PerturbationDistribution,
    pub sigma: f64,
    /// Fraction of simulations with zero violations, in [0, 1]
    pub feasibility_rate: f64,
    /// Wilson 95 % confidence interval over the feasibility rate
    pub confidence_interval: (f64, f64),
    pub mean_violations: f64,
    pub grade: RobustnessGrade,
    pub recommendation: String,
}

/// Structured warning attached to a completed result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobWarning {
    pub code: String,
    pub message: String,
}

impl JobWarning {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Input payload of an optimization job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeJobRequest {
    pub routes: Vec<Route>,
    #[serde(default)]
    pub options: OptimizerOptions,
}

/// Result payload of a completed job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeResult {
    pub schedule: DaySchedule,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<MonteCarloResult>,
    #[serde(default)]
    pub warnings: Vec<JobWarning>,
}

/// A job row as persisted in the store
#[derive(Debug, Clone, FromRow)]
pub struct JobRecord {
    pub id: Uuid,
    pub status: String,
    pub phase: String,
    pub progress: i32,
    pub payload: Json<OptimizeJobRequest>,
    pub result: Option<Json<OptimizeResult>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn state(&self) -> JobState {
        JobState::parse(&self.status).unwrap_or(JobState::Failed)
    }

    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.id,
            status: self.state(),
            phase: self.phase.clone(),
            progress: self.progress.clamp(0, 100) as u8,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error_code.as_ref().map(|code| JobErrorView {
                code: code.clone(),
                message: self.error_message.clone().unwrap_or_default(),
            }),
        }
    }
}

/// Error detail shown on the job view
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorView {
    pub code: String,
    pub message: String,
}

/// Snapshot of a job's externally visible state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub job_id: Uuid,
    pub status: JobState,
    pub phase: String,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorView>,
}

/// Response to a job submission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSubmitResponse {
    pub job_id: Uuid,
    pub status: JobState,
    pub websocket_url: String,
}

impl JobSubmitResponse {
    pub fn queued(job_id: Uuid) -> Self {
        Self {
            job_id,
            status: JobState::Queued,
            websocket_url: format!("/ws/optimize/{}", job_id),
        }
    }
}
