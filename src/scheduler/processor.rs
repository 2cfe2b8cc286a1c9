use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{watch, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::controller::AutomationState;
use crate::error::{EngineError, Result};
use crate::history::{self, CalculationHistoryEntry};
use crate::scheduler::job::{AttemptError, Job, JobStatus};
use crate::scheduler::queue::{JobQueue, RetryOutcome};
use crate::snapshot::{SnapshotId, SnapshotStore};
use crate::standings::{self, StandingsTable};
use crate::storage::{GameSource, Storage};

/// Executes queued jobs.
///
/// Each worker loop repeatedly dequeues, executes and reports. An attempt
/// runs under `job_timeout`; the live table is only replaced once the new
/// table is fully computed, so readers never see a partial table.
#[derive(Clone)]
pub struct JobProcessor {
    queue: Arc<RwLock<JobQueue>>,
    notify: Arc<Notify>,
    games: Arc<dyn GameSource>,
    storage: Arc<dyn Storage>,
    snapshots: SnapshotStore,
    config: Arc<EngineConfig>,
}

impl JobProcessor {
    pub fn new(
        queue: Arc<RwLock<JobQueue>>,
        notify: Arc<Notify>,
        games: Arc<dyn GameSource>,
        storage: Arc<dyn Storage>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            snapshots: SnapshotStore::new(storage.clone()),
            queue,
            notify,
            games,
            storage,
            config,
        }
    }

    /// Worker loop. Dequeues only while the controller is `Running`; parks on
    /// the queue notifier (or the poll interval) when nothing is runnable.
    pub async fn run_worker(
        self,
        worker_id: usize,
        mut state_rx: watch::Receiver<AutomationState>,
        shutdown: CancellationToken,
    ) {
        tracing::info!(worker_id, "Worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if *state_rx.borrow_and_update() != AutomationState::Running {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            }

            let next = {
                let mut queue = self.queue.write().await;
                // A pause may have landed while this worker waited for the lock.
                if *state_rx.borrow() == AutomationState::Running {
                    queue.dequeue()
                } else {
                    None
                }
            };
            match next {
                Some(job) => {
                    tracing::debug!(worker_id, job_id = %job.id, table = %job.key, "Job dequeued");
                    self.process(job).await;
                }
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.notify.notified() => {}
                        changed = state_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
            }
        }

        tracing::info!(worker_id, "Worker stopped");
    }

    /// Dequeue and process one job, if any is runnable.
    pub async fn run_next(&self) -> Option<JobStatus> {
        let job = self.queue.write().await.dequeue()?;
        Some(self.process(job).await)
    }

    /// Run one attempt of a job that is already marked processing.
    ///
    /// Returns the job's status afterwards: `Completed`, `Failed`, `Pending`
    /// (queued for retry) or `Cancelled` (superseded by a newer job).
    pub async fn process(&self, job: Job) -> JobStatus {
        let mut staged: Option<SnapshotId> = None;
        let outcome = tokio::time::timeout(
            self.config.job_timeout(),
            self.execute(&job, &mut staged),
        )
        .await
        .unwrap_or_else(|_| Err(EngineError::Timeout(self.config.job_timeout_ms)));

        match outcome {
            Ok(entries_updated) => {
                let finished = self.queue.write().await.complete(&job.id);
                // A pending job for the same table may have been waiting on this one.
                self.notify.notify_waiters();

                if let Some(finished) = finished {
                    tracing::info!(
                        job_id = %job.id,
                        table = %job.key,
                        entries_updated,
                        duration_ms = ?finished.duration_ms(),
                        "Job completed"
                    );
                }
                if let Err(e) = self
                    .snapshots
                    .prune_table(&job.key, &self.config.retention)
                    .await
                {
                    tracing::warn!(table = %job.key, error = %e, "Snapshot pruning failed");
                }
                JobStatus::Completed
            }
            Err(err) => {
                if let Some(snapshot_id) = staged {
                    self.discard_snapshot(&snapshot_id).await;
                }
                self.handle_failure(&job, err).await
            }
        }
    }

    /// Apply the job, then append its history entry. A failed append fails
    /// the attempt like any other storage error; re-applying over unchanged
    /// games writes the same table again.
    async fn execute(&self, job: &Job, staged: &mut Option<SnapshotId>) -> Result<usize> {
        let entries_updated = self.apply(job, staged).await?;

        let mut finished = job.clone();
        finished.status = JobStatus::Completed;
        finished.completed_at = Some(Utc::now());
        self.storage
            .append_history(CalculationHistoryEntry::for_job(&finished, entries_updated))
            .await?;
        Ok(entries_updated)
    }

    /// fetch games -> snapshot live table -> compute -> swap live table.
    ///
    /// `staged` holds the id of a snapshot saved by this attempt until the
    /// swap succeeds, so the caller can discard it if the attempt is abandoned.
    async fn apply(&self, job: &Job, staged: &mut Option<SnapshotId>) -> Result<usize> {
        let rules = self.config.rules_for(&job.key.league);
        let games = self.games.games(&job.key).await?;
        let roster = self.games.roster(&job.key).await?;

        let previous = self.storage.live_table(&job.key).await?;
        if let Some(previous) = &previous {
            *staged = Some(self.snapshots.save(previous, job.trigger.clone()).await?);
        }

        let entries = match standings::compute(&games, roster.as_deref(), &rules) {
            Ok(entries) => entries,
            Err(EngineError::EmptyInput) if previous.is_none() => {
                tracing::info!(job_id = %job.id, table = %job.key, "No games yet, no table written");
                return Ok(0);
            }
            // Every game was removed: replace the stale table with an empty one.
            Err(EngineError::EmptyInput) => Vec::new(),
            Err(e) => return Err(e),
        };

        let count = entries.len();
        let table = StandingsTable::new(job.key.clone(), entries, job.trigger.clone());
        self.storage.replace_live_table(Arc::new(table)).await?;
        *staged = None;
        Ok(count)
    }

    async fn handle_failure(&self, job: &Job, err: EngineError) -> JobStatus {
        let attempt = AttemptError::from_error(&err);

        if err.is_retryable() && job.retry_count < self.config.max_retries {
            let delay = self.backoff(job.retry_count + 1);
            let not_before = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            tracing::warn!(
                job_id = %job.id,
                table = %job.key,
                attempt = job.retry_count + 1,
                max_retries = self.config.max_retries,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Job attempt failed, retrying"
            );

            let outcome = self.queue.write().await.retry(&job.id, attempt, not_before);
            // The table is free again; a newer job may be waiting on it.
            self.notify.notify_waiters();
            return match outcome {
                Some(RetryOutcome::Requeued) => JobStatus::Pending,
                Some(RetryOutcome::Superseded(_)) => JobStatus::Cancelled,
                None => JobStatus::Failed,
            };
        }

        tracing::error!(
            job_id = %job.id,
            table = %job.key,
            attempts = job.retry_count + 1,
            error = %err,
            "Job failed"
        );
        let failed = self.queue.write().await.fail(&job.id, attempt);
        self.notify.notify_waiters();
        if let Some(failed) = failed {
            let recorded = history::append_with_retry(
                self.storage.as_ref(),
                CalculationHistoryEntry::for_job(&failed, 0),
                self.config.max_retries + 1,
                Duration::from_millis(self.config.retry_backoff_ms),
            )
            .await;
            if let Err(e) = recorded {
                tracing::error!(job_id = %job.id, error = %e, "Failed to append calculation history");
            }
        }
        JobStatus::Failed
    }

    /// Exponential delay for the given attempt number, capped, plus up to 20% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.retry_backoff_ms;
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.config.max_retry_backoff_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped / 5);
        Duration::from_millis(capped + jitter)
    }

    async fn discard_snapshot(&self, snapshot_id: &SnapshotId) {
        if let Err(e) = self.storage.remove_snapshot(snapshot_id).await {
            tracing::warn!(snapshot_id = %snapshot_id, error = %e, "Failed to discard staged snapshot");
        }
    }
}
