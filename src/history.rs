use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::scheduler::{CalculationTrigger, Job, JobId, JobStatus};
use crate::standings::TableKey;
use crate::storage::Storage;

/// Audit record of one terminal job outcome or one rollback.
///
/// Append-only. A job contributes exactly one entry, whether it completed or
/// failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationHistoryEntry {
    pub id: Uuid,
    pub key: TableKey,
    pub trigger: CalculationTrigger,
    pub status: JobStatus,
    /// `None` for rollbacks, which do not run as jobs.
    pub job_id: Option<JobId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub attempts: u32,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub entries_updated: usize,
}

impl CalculationHistoryEntry {
    /// Entry for a job that reached `Completed` or `Failed`.
    pub fn for_job(job: &Job, entries_updated: usize) -> Self {
        let finished_at = job.completed_at.unwrap_or_else(Utc::now);
        let started_at = job.started_at.unwrap_or(job.created_at);
        let failure = if job.status == JobStatus::Failed {
            job.attempt_errors.last()
        } else {
            None
        };

        Self {
            id: Uuid::new_v4(),
            key: job.key.clone(),
            trigger: job.trigger.clone(),
            status: job.status,
            job_id: Some(job.id),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
            attempts: job.retry_count + 1,
            error_kind: failure.map(|e| e.kind.clone()),
            error: failure.map(|e| e.message.clone()),
            entries_updated,
        }
    }

    /// Entry for a snapshot restored onto the live table.
    pub fn for_rollback(
        key: TableKey,
        snapshot_id: Uuid,
        started_at: DateTime<Utc>,
        entries_updated: usize,
    ) -> Self {
        let finished_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            trigger: CalculationTrigger::Rollback {
                key: key.clone(),
                snapshot_id,
            },
            key,
            status: JobStatus::Completed,
            job_id: None,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
            attempts: 1,
            error_kind: None,
            error: None,
            entries_updated,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }

    pub fn is_timeout(&self) -> bool {
        self.error_kind.as_deref() == Some("timeout")
    }
}

/// Append `entry` for an outcome that has already taken effect, retrying
/// retryable storage errors up to `attempts` times in total.
pub async fn append_with_retry(
    storage: &dyn Storage,
    entry: CalculationHistoryEntry,
    attempts: u32,
    pause: Duration,
) -> Result<()> {
    let mut attempt = 1;
    loop {
        match storage.append_history(entry.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    entry_id = %entry.id,
                    attempt,
                    error = %e,
                    "History append failed, retrying"
                );
                attempt += 1;
                tokio::time::sleep(pause).await;
            }
            Err(e) => return Err(e),
        }
    }
}
