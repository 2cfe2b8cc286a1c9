use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::scheduler::job::{AttemptError, CalculationTrigger, Job, JobId, JobStatus, Priority};
use crate::standings::TableKey;

const DEFAULT_FINISHED_LIMIT: usize = 500;

/// Result of admitting a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub job_id: JobId,
    /// True when the trigger was merged into an existing pending job.
    pub coalesced: bool,
}

/// What happened to a job handed back for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Back in the queue as pending.
    Requeued,
    /// Folded into a newer pending job for the same table.
    Superseded(JobId),
}

/// Position in the pending order: priority first, then admission sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    priority: Reverse<Priority>,
    seq: u64,
}

/// Pending counts per priority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityCounts {
    pub low: usize,
    pub normal: usize,
    pub high: usize,
    pub critical: usize,
}

impl PriorityCounts {
    fn add(&mut self, priority: Priority) {
        match priority {
            Priority::Low => self.low += 1,
            Priority::Normal => self.normal += 1,
            Priority::High => self.high += 1,
            Priority::Critical => self.critical += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.low + self.normal + self.high + self.critical
    }
}

/// Read-only view over the queue, computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub pending_by_priority: PriorityCounts,
    pub processing: usize,
    /// Tables with a job currently executing.
    pub processing_tables: Vec<TableKey>,
    /// Pending jobs that already failed at least once.
    pub retrying: usize,
    /// Timed-out attempts recorded on jobs that have not finished yet.
    pub timed_out_attempts: usize,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    /// Outcomes among the finished jobs still retained by the queue.
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Priority-ordered, per-table deduplicated job queue.
///
/// At most one job per table is pending and at most one is processing. A
/// pending job whose table is processing waits until that execution ends,
/// so two workers never write the same live table concurrently.
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<JobId, Job>,
    order: BTreeMap<Slot, JobId>,
    slots: HashMap<JobId, Slot>,
    pending_by_key: HashMap<TableKey, JobId>,
    processing_by_key: HashMap<TableKey, JobId>,
    finished: VecDeque<JobId>,
    finished_limit: usize,
    next_seq: u64,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_finished_limit(DEFAULT_FINISHED_LIMIT)
    }

    pub fn with_finished_limit(finished_limit: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            order: BTreeMap::new(),
            slots: HashMap::new(),
            pending_by_key: HashMap::new(),
            processing_by_key: HashMap::new(),
            finished: VecDeque::new(),
            finished_limit,
            next_seq: 0,
        }
    }

    /// Admit a trigger, or merge it into the pending job for the same table.
    ///
    /// A merge raises the pending job's priority to the higher of the two.
    /// `priority` defaults to the trigger's own default.
    pub fn enqueue(
        &mut self,
        trigger: CalculationTrigger,
        priority: Option<Priority>,
    ) -> Result<EnqueueOutcome> {
        if trigger.is_rollback() {
            return Err(EngineError::InvalidInput(
                "rollback triggers cannot be enqueued".to_string(),
            ));
        }
        let priority = priority.unwrap_or_else(|| trigger.default_priority());

        if let Some(&job_id) = self.pending_by_key.get(trigger.key()) {
            let mut raised = false;
            if let Some(job) = self.jobs.get_mut(&job_id) {
                tracing::debug!(
                    job_id = %job_id,
                    trigger = %trigger,
                    "Trigger coalesced into pending job"
                );
                job.coalesced.push(trigger);
                if priority > job.priority {
                    job.priority = priority;
                    raised = true;
                }
            }
            if raised {
                self.reslot(job_id, priority);
            }
            return Ok(EnqueueOutcome {
                job_id,
                coalesced: true,
            });
        }

        let job = Job::new(trigger, priority);
        let job_id = job.id;
        self.pending_by_key.insert(job.key.clone(), job_id);
        self.jobs.insert(job_id, job);
        self.push_slot(job_id, priority);
        tracing::debug!(job_id = %job_id, priority = %priority, "Job enqueued");

        Ok(EnqueueOutcome {
            job_id,
            coalesced: false,
        })
    }

    /// Take the next runnable job and mark it processing.
    pub fn dequeue(&mut self) -> Option<Job> {
        self.dequeue_at(Utc::now())
    }

    /// As [`dequeue`](Self::dequeue), evaluating retry delays against `now`.
    pub fn dequeue_at(&mut self, now: DateTime<Utc>) -> Option<Job> {
        let (slot, job_id) = self
            .order
            .iter()
            .find(|(_, id)| {
                self.jobs.get(*id).is_some_and(|job| {
                    job.is_ready(now) && !self.processing_by_key.contains_key(&job.key)
                })
            })
            .map(|(slot, id)| (*slot, *id))?;

        self.order.remove(&slot);
        self.slots.remove(&job_id);
        let job = self.jobs.get_mut(&job_id)?;
        self.pending_by_key.remove(&job.key);
        self.processing_by_key.insert(job.key.clone(), job_id);

        job.status = JobStatus::Processing;
        job.started_at = Some(now);
        job.completed_at = None;
        job.not_before = None;
        Some(job.clone())
    }

    /// Pending jobs in the order they would be dequeued, ignoring retry
    /// delays and busy tables.
    pub fn peek(&self) -> Vec<Job> {
        self.order
            .values()
            .filter_map(|id| self.jobs.get(id))
            .cloned()
            .collect()
    }

    /// Withdraw a pending job.
    ///
    /// # Errors
    ///
    /// - [`EngineError::AlreadyProcessing`] if the job has started
    /// - [`EngineError::NotFound`] if no such job is pending
    pub fn cancel(&mut self, job_id: &JobId) -> Result<Job> {
        let status = self
            .jobs
            .get(job_id)
            .map(|job| job.status)
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))?;

        match status {
            JobStatus::Pending => {}
            JobStatus::Processing => {
                return Err(EngineError::AlreadyProcessing(job_id.to_string()));
            }
            _ => {
                return Err(EngineError::NotFound(format!("pending job {}", job_id)));
            }
        }

        self.unslot(job_id);
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))?;
        self.pending_by_key.remove(&job.key);
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        let cancelled = job.clone();
        self.retire(*job_id);

        tracing::info!(job_id = %job_id, table = %cancelled.key, "Job cancelled");
        Ok(cancelled)
    }

    /// Mark a processing job completed.
    pub fn complete(&mut self, job_id: &JobId) -> Option<Job> {
        let job = self.finish_processing(job_id)?;
        job.status = JobStatus::Completed;
        let job = job.clone();
        self.retire(*job_id);
        Some(job)
    }

    /// Mark a processing job permanently failed.
    pub fn fail(&mut self, job_id: &JobId, error: AttemptError) -> Option<Job> {
        let job = self.finish_processing(job_id)?;
        job.status = JobStatus::Failed;
        job.last_error = Some(error.message.clone());
        job.attempt_errors.push(error);
        let job = job.clone();
        self.retire(*job_id);
        Some(job)
    }

    /// Hand a processing job back after a failed attempt.
    ///
    /// The job keeps its priority and becomes eligible again at `not_before`.
    /// If a newer job for the same table is already pending, the failed job is
    /// folded into it instead and cancelled.
    pub fn retry(
        &mut self,
        job_id: &JobId,
        error: AttemptError,
        not_before: DateTime<Utc>,
    ) -> Option<RetryOutcome> {
        let (key, priority) = {
            let job = self.finish_processing(job_id)?;
            job.retry_count += 1;
            job.last_error = Some(error.message.clone());
            job.attempt_errors.push(error);
            (job.key.clone(), job.priority)
        };

        let Some(newer_id) = self.pending_by_key.get(&key).copied() else {
            if let Some(job) = self.jobs.get_mut(job_id) {
                job.status = JobStatus::Pending;
                job.completed_at = None;
                job.not_before = Some(not_before);
            }
            self.pending_by_key.insert(key, *job_id);
            self.push_slot(*job_id, priority);
            return Some(RetryOutcome::Requeued);
        };

        let carried = match self.jobs.get_mut(job_id) {
            Some(job) => {
                job.status = JobStatus::Cancelled;
                job.last_error = Some(format!("superseded by {}", newer_id));
                let mut carried = vec![job.trigger.clone()];
                carried.extend(job.coalesced.iter().cloned());
                carried
            }
            None => Vec::new(),
        };
        self.retire(*job_id);

        let mut raised = false;
        if let Some(newer) = self.jobs.get_mut(&newer_id) {
            newer.coalesced.extend(carried);
            if priority > newer.priority {
                newer.priority = priority;
                raised = true;
            }
        }
        if raised {
            self.reslot(newer_id, priority);
        }
        tracing::info!(
            job_id = %job_id,
            newer_job_id = %newer_id,
            "Failed job superseded by newer pending job"
        );
        Some(RetryOutcome::Superseded(newer_id))
    }

    pub fn get_job(&self, job_id: &JobId) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn processing_jobs(&self) -> Vec<&Job> {
        self.processing_by_key
            .values()
            .filter_map(|id| self.jobs.get(id))
            .collect()
    }

    /// The pending job for `key`, if any.
    pub fn pending_for(&self, key: &TableKey) -> Option<&Job> {
        self.pending_by_key.get(key).and_then(|id| self.jobs.get(id))
    }

    pub fn pending_len(&self) -> usize {
        self.order.len()
    }

    pub fn processing_len(&self) -> usize {
        self.processing_by_key.len()
    }

    /// Jobs tracked, including retained finished jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn status(&self) -> QueueStatus {
        let mut pending_by_priority = PriorityCounts::default();
        let mut retrying = 0;
        let mut oldest_pending_at: Option<DateTime<Utc>> = None;
        let mut timed_out_attempts = 0;
        let (mut completed, mut failed, mut cancelled) = (0, 0, 0);

        for job in self.jobs.values() {
            match job.status {
                JobStatus::Pending => {
                    pending_by_priority.add(job.priority);
                    if job.retry_count > 0 {
                        retrying += 1;
                    }
                    oldest_pending_at = Some(match oldest_pending_at {
                        Some(at) => at.min(job.created_at),
                        None => job.created_at,
                    });
                }
                JobStatus::Processing => {}
                JobStatus::Completed => completed += 1,
                JobStatus::Failed => failed += 1,
                JobStatus::Cancelled => cancelled += 1,
            }
            if !job.status.is_finished() {
                timed_out_attempts += job.attempt_errors.iter().filter(|e| e.is_timeout()).count();
            }
        }

        let mut processing_tables: Vec<TableKey> =
            self.processing_by_key.keys().cloned().collect();
        processing_tables.sort();

        QueueStatus {
            pending: pending_by_priority.total(),
            pending_by_priority,
            processing: self.processing_by_key.len(),
            processing_tables,
            retrying,
            timed_out_attempts,
            oldest_pending_at,
            completed,
            failed,
            cancelled,
        }
    }

    fn push_slot(&mut self, job_id: JobId, priority: Priority) {
        let slot = Slot {
            priority: Reverse(priority),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.order.insert(slot, job_id);
        self.slots.insert(job_id, slot);
    }

    /// Move a pending job to a new priority, keeping its admission sequence.
    fn reslot(&mut self, job_id: JobId, priority: Priority) {
        if let Some(old) = self.slots.remove(&job_id) {
            self.order.remove(&old);
            let slot = Slot {
                priority: Reverse(priority),
                seq: old.seq,
            };
            self.order.insert(slot, job_id);
            self.slots.insert(job_id, slot);
        }
    }

    fn unslot(&mut self, job_id: &JobId) {
        if let Some(slot) = self.slots.remove(job_id) {
            self.order.remove(&slot);
        }
    }

    fn finish_processing(&mut self, job_id: &JobId) -> Option<&mut Job> {
        let job = self.jobs.get_mut(job_id)?;
        if job.status != JobStatus::Processing {
            return None;
        }
        if self.processing_by_key.get(&job.key) == Some(job_id) {
            self.processing_by_key.remove(&job.key);
        }
        job.completed_at = Some(Utc::now());
        Some(job)
    }

    /// Keep a finished job for status queries, evicting the oldest beyond the limit.
    fn retire(&mut self, job_id: JobId) {
        self.finished.push_back(job_id);
        while self.finished.len() > self.finished_limit {
            if let Some(old) = self.finished.pop_front() {
                self.jobs.remove(&old);
            }
        }
    }
}
