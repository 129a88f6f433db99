//! Progress events published by running jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fixed phase lattice of an optimization run. Each phase carries the
/// progress percentage at which it begins; published progress within a
/// phase may only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerPhase {
    Starting,
    Loading,
    Preprocessing,
    TravelMatrix,
    BuildingChains,
    MatchingBlocks,
    LocalSearch,
    Finalizing,
    CalculatingStats,
    Completed,
}

impl OptimizerPhase {
    /// Progress percentage at which this phase begins
    pub fn base_progress(&self) -> u8 {
        match self {
            OptimizerPhase::Starting => 0,
            OptimizerPhase::Loading => 2,
            OptimizerPhase::Preprocessing => 5,
            OptimizerPhase::TravelMatrix => 15,
            OptimizerPhase::BuildingChains => 35,
            OptimizerPhase::MatchingBlocks => 60,
            OptimizerPhase::LocalSearch => 80,
            OptimizerPhase::Finalizing => 90,
            OptimizerPhase::CalculatingStats => 95,
            OptimizerPhase::Completed => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerPhase::Starting => "starting",
            OptimizerPhase::Loading => "loading",
            OptimizerPhase::Preprocessing => "preprocessing",
            OptimizerPhase::TravelMatrix => "travel_matrix",
            OptimizerPhase::BuildingChains => "building_chains",
            OptimizerPhase::MatchingBlocks => "matching_blocks",
            OptimizerPhase::LocalSearch => "local_search",
            OptimizerPhase::Finalizing => "finalizing",
            OptimizerPhase::CalculatingStats => "calculating_stats",
            OptimizerPhase::Completed => "completed",
        }
    }

    /// All phases in lattice order
    pub fn all() -> &'static [OptimizerPhase] {
        &[
            OptimizerPhase::Starting,
            OptimizerPhase::Loading,
            OptimizerPhase::Preprocessing,
            OptimizerPhase::TravelMatrix,
            OptimizerPhase::BuildingChains,
            OptimizerPhase::MatchingBlocks,
            OptimizerPhase::LocalSearch,
            OptimizerPhase::Finalizing,
            OptimizerPhase::CalculatingStats,
            OptimizerPhase::Completed,
        ]
    }
}

/// Kind of event carried to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProgressKind {
    Progress,
    Completed,
    Error,
    Cancelled,
}

impl ProgressKind {
    /// Terminal events always bypass throttling and close the stream
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressKind::Progress)
    }
}

/// A single progress update from a running job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub kind: ProgressKind,
    pub phase: OptimizerPhase,
    /// 0–100, monotonically non-decreasing within a job
    pub progress: u8,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn progress(job_id: Uuid, phase: OptimizerPhase, progress: u8, message: impl Into<String>) -> Self {
        Self {
            job_id,
            kind: ProgressKind::Progress,
            phase,
            progress,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn completed(job_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            job_id,
            kind: ProgressKind::Completed,
            phase: OptimizerPhase::Completed,
            progress: 100,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(job_id: Uuid, phase: OptimizerPhase, progress: u8, message: impl Into<String>) -> Self {
        Self {
            job_id,
            kind: ProgressKind::Error,
            phase,
            progress,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn cancelled(job_id: Uuid, phase: OptimizerPhase, progress: u8) -> Self {
        Self {
            job_id,
            kind: ProgressKind::Cancelled,
            phase,
            progress,
            message: "job cancelled".to_string(),
            timestamp: Utc::now(),
        }
    }
}
