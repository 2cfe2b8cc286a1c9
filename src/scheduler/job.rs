use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::standings::TableKey;

pub type JobId = Uuid;

/// Queue priority. Declaration order is significant: `Critical` sorts highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a table is being recomputed (or, for `Rollback`, restored).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalculationTrigger {
    GameResult {
        key: TableKey,
        game_id: String,
    },
    GameCreated {
        key: TableKey,
        game_id: String,
    },
    GameDeleted {
        key: TableKey,
        game_id: String,
    },
    Manual {
        key: TableKey,
        #[serde(default)]
        description: Option<String>,
    },
    Scheduled {
        key: TableKey,
    },
    /// Recorded in history when a snapshot is restored. Never enqueued.
    Rollback {
        key: TableKey,
        snapshot_id: Uuid,
    },
}

impl CalculationTrigger {
    pub fn manual(key: TableKey, description: Option<String>) -> Self {
        CalculationTrigger::Manual { key, description }
    }

    pub fn key(&self) -> &TableKey {
        match self {
            CalculationTrigger::GameResult { key, .. }
            | CalculationTrigger::GameCreated { key, .. }
            | CalculationTrigger::GameDeleted { key, .. }
            | CalculationTrigger::Manual { key, .. }
            | CalculationTrigger::Scheduled { key }
            | CalculationTrigger::Rollback { key, .. } => key,
        }
    }

    /// Priority used when the caller does not ask for one.
    pub fn default_priority(&self) -> Priority {
        match self {
            CalculationTrigger::Manual { .. } => Priority::High,
            CalculationTrigger::GameResult { .. } | CalculationTrigger::GameDeleted { .. } => {
                Priority::Normal
            }
            CalculationTrigger::GameCreated { .. } | CalculationTrigger::Scheduled { .. } => {
                Priority::Low
            }
            CalculationTrigger::Rollback { .. } => Priority::Critical,
        }
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self, CalculationTrigger::Rollback { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            CalculationTrigger::GameResult { .. } => "game_result",
            CalculationTrigger::GameCreated { .. } => "game_created",
            CalculationTrigger::GameDeleted { .. } => "game_deleted",
            CalculationTrigger::Manual { .. } => "manual",
            CalculationTrigger::Scheduled { .. } => "scheduled",
            CalculationTrigger::Rollback { .. } => "rollback",
        }
    }
}

impl std::fmt::Display for CalculationTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name(), self.key())
    }
}

/// A failed execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptError {
    /// [`EngineError::kind`](crate::error::EngineError::kind) of the failure.
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl AttemptError {
    pub fn from_error(err: &EngineError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            at: Utc::now(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == "timeout"
    }
}

/// One recalculation request for a (league, season).
///
/// Created by the controller on trigger receipt; every later mutation goes
/// through [`JobQueue`](super::JobQueue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub key: TableKey,
    pub priority: Priority,
    pub status: JobStatus,
    /// The trigger that created the job.
    pub trigger: CalculationTrigger,
    /// Triggers merged into this job while it was pending.
    pub coalesced: Vec<CalculationTrigger>,
    pub retry_count: u32,
    /// One record per failed attempt, oldest first.
    pub attempt_errors: Vec<AttemptError>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Retried jobs are not dequeued before this instant.
    pub not_before: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(trigger: CalculationTrigger, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: trigger.key().clone(),
            priority,
            status: JobStatus::Pending,
            trigger,
            coalesced: Vec::new(),
            retry_count: 0,
            attempt_errors: Vec::new(),
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            not_before: None,
        }
    }

    /// Whether the job may be dequeued at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }

    /// Time from the start of the last attempt to completion.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
