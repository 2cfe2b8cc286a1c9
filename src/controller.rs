use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::health::{HealthMonitor, SystemHealth};
use crate::history::CalculationHistoryEntry;
use crate::scheduler::{
    CalculationTrigger, EnqueueOutcome, Job, JobId, JobProcessor, JobQueue, Priority, QueueStatus,
};
use crate::snapshot::{Snapshot, SnapshotId, SnapshotMeta, SnapshotStore};
use crate::standings::{Game, StandingsTable, TableKey};
use crate::storage::{GameSource, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationState {
    Running,
    Paused,
    Stopped,
}

impl std::fmt::Display for AutomationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutomationState::Running => write!(f, "running"),
            AutomationState::Paused => write!(f, "paused"),
            AutomationState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Entry point for everything that drives the engine.
///
/// Owns the queue, the worker pool and the snapshot store. Construct one per
/// process and share it behind an `Arc`.
///
/// - `Running`: triggers are enqueued and workers dequeue.
/// - `Paused`: triggers are still enqueued; workers idle until resumed.
/// - `Stopped`: triggers and rollbacks are rejected with
///   [`EngineError::AutomationStopped`].
pub struct AutomationController {
    config: Arc<EngineConfig>,
    queue: Arc<RwLock<JobQueue>>,
    notify: Arc<Notify>,
    state: watch::Sender<AutomationState>,
    processor: JobProcessor,
    snapshots: SnapshotStore,
    storage: Arc<dyn Storage>,
    games: Arc<dyn GameSource>,
    health: Arc<HealthMonitor>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AutomationController {
    /// Build a controller in the `Stopped` state. Call [`start`](Self::start)
    /// to spawn the workers.
    pub fn new(
        config: EngineConfig,
        games: Arc<dyn GameSource>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let queue = Arc::new(RwLock::new(JobQueue::with_finished_limit(
            config.finished_job_limit,
        )));
        let notify = Arc::new(Notify::new());
        let (state, _) = watch::channel(AutomationState::Stopped);
        let processor = JobProcessor::new(
            queue.clone(),
            notify.clone(),
            games.clone(),
            storage.clone(),
            config.clone(),
        );

        Ok(Self {
            health: Arc::new(HealthMonitor::new(config.health.clone())),
            snapshots: SnapshotStore::new(storage.clone()),
            config,
            queue,
            notify,
            state,
            processor,
            storage,
            games,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn processor(&self) -> &JobProcessor {
        &self.processor
    }

    pub fn state(&self) -> AutomationState {
        *self.state.borrow()
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    /// Enter `Running` from any state. Spawns the worker pool on first use.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AutomationStopped`] after [`shutdown`](Self::shutdown).
    pub async fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::AutomationStopped);
        }

        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            self.spawn_tasks(&mut tasks);
        }
        drop(tasks);

        self.transition(AutomationState::Running);
        Ok(())
    }

    /// Stop dequeuing. Jobs already executing run to completion.
    pub fn pause(&self) -> Result<()> {
        if self.state() == AutomationState::Stopped {
            return Err(EngineError::AutomationStopped);
        }
        self.transition(AutomationState::Paused);
        Ok(())
    }

    /// Resume dequeuing; the backlog drains in priority order.
    pub fn resume(&self) -> Result<()> {
        if self.state() == AutomationState::Stopped {
            return Err(EngineError::AutomationStopped);
        }
        self.transition(AutomationState::Running);
        Ok(())
    }

    /// Reject new triggers and idle the workers. Pending jobs are kept and
    /// run again after [`start`](Self::start).
    pub fn stop(&self) {
        self.transition(AutomationState::Stopped);
    }

    /// Stop, then wait for every worker and background task to exit.
    /// In-flight jobs finish (or time out) first.
    pub async fn shutdown(&self) {
        self.stop();
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Background task panicked");
            }
        }
        tracing::info!("Automation controller shut down");
    }

    fn transition(&self, next: AutomationState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            tracing::info!(state = %next, "Automation state changed");
        }
    }

    fn spawn_tasks(&self, tasks: &mut Vec<JoinHandle<()>>) {
        for worker_id in 0..self.config.queue_concurrency {
            let processor = self.processor.clone();
            let state_rx = self.state.subscribe();
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                processor.run_worker(worker_id, state_rx, shutdown).await;
            }));
        }

        let queue = self.queue.clone();
        let health = self.health.clone();
        let shutdown = self.shutdown.clone();
        let period = self.config.health_sample_interval();
        tasks.push(tokio::spawn(async move {
            Self::sample_loop(queue, health, period, shutdown).await;
        }));

        if let Some(period) = self.config.sweep_interval() {
            let sweeper = Sweeper {
                queue: self.queue.clone(),
                notify: self.notify.clone(),
                games: self.games.clone(),
                state: self.state.subscribe(),
            };
            let shutdown = self.shutdown.clone();
            tasks.push(tokio::spawn(async move {
                sweeper.run(period, shutdown).await;
            }));
        }

        tracing::info!(
            workers = self.config.queue_concurrency,
            sweep = self.config.sweep_interval().is_some(),
            "Background tasks spawned"
        );
    }

    async fn sample_loop(
        queue: Arc<RwLock<JobQueue>>,
        health: Arc<HealthMonitor>,
        period: std::time::Duration,
        shutdown: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let depth = queue.read().await.pending_len();
                    health.record_depth(depth);
                }
            }
        }
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    /// Admit a trigger. `priority` defaults to the trigger's own default.
    pub async fn trigger(
        &self,
        trigger: CalculationTrigger,
        priority: Option<Priority>,
    ) -> Result<EnqueueOutcome> {
        if self.state() == AutomationState::Stopped {
            return Err(EngineError::AutomationStopped);
        }
        let outcome = self.queue.write().await.enqueue(trigger, priority)?;
        self.notify.notify_one();
        Ok(outcome)
    }

    /// Manual recalculation request. Returns the (possibly coalesced) job id.
    pub async fn trigger_recalculation(
        &self,
        league: &str,
        season: &str,
        priority: Option<Priority>,
        description: Option<String>,
    ) -> Result<JobId> {
        let trigger = CalculationTrigger::manual(TableKey::new(league, season), description);
        let outcome = self.trigger(trigger, priority).await?;
        tracing::info!(
            job_id = %outcome.job_id,
            league,
            season,
            coalesced = outcome.coalesced,
            "Manual recalculation requested"
        );
        Ok(outcome.job_id)
    }

    /// A game's result was saved or changed.
    pub async fn game_saved(&self, game: &Game) -> Result<EnqueueOutcome> {
        self.trigger(
            CalculationTrigger::GameResult {
                key: game.key(),
                game_id: game.id.clone(),
            },
            None,
        )
        .await
    }

    pub async fn game_created(&self, game: &Game) -> Result<EnqueueOutcome> {
        self.trigger(
            CalculationTrigger::GameCreated {
                key: game.key(),
                game_id: game.id.clone(),
            },
            None,
        )
        .await
    }

    pub async fn game_deleted(&self, key: TableKey, game_id: &str) -> Result<EnqueueOutcome> {
        self.trigger(
            CalculationTrigger::GameDeleted {
                key,
                game_id: game_id.to_string(),
            },
            None,
        )
        .await
    }

    /// Enqueue a `Scheduled` trigger for every table the game source knows.
    pub async fn sweep_now(&self) -> Result<usize> {
        if self.state() == AutomationState::Stopped {
            return Err(EngineError::AutomationStopped);
        }
        sweep(&self.queue, &self.notify, self.games.as_ref()).await
    }

    // =========================================================================
    // Jobs and queue
    // =========================================================================

    pub async fn cancel(&self, job_id: &JobId) -> Result<Job> {
        self.queue.write().await.cancel(job_id)
    }

    pub async fn job(&self, job_id: &JobId) -> Result<Job> {
        self.queue
            .read()
            .await
            .get_job(job_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))
    }

    /// Pending jobs in dequeue order.
    pub async fn pending_jobs(&self) -> Vec<Job> {
        self.queue.read().await.peek()
    }

    pub async fn queue_status(&self) -> QueueStatus {
        self.queue.read().await.status()
    }

    // =========================================================================
    // Tables and snapshots
    // =========================================================================

    pub async fn live_table(&self, key: &TableKey) -> Result<Arc<StandingsTable>> {
        self.storage
            .live_table(key)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("table {}", key)))
    }

    pub async fn list_snapshots(&self, key: &TableKey) -> Result<Vec<SnapshotMeta>> {
        self.snapshots.list(key).await
    }

    pub async fn snapshot(&self, id: &SnapshotId) -> Result<Snapshot> {
        self.snapshots.snapshot(id).await
    }

    pub async fn delete_snapshot(&self, id: &SnapshotId) -> Result<()> {
        self.snapshots.delete(id).await
    }

    /// Apply the configured retention policy to every table.
    pub async fn prune_snapshots(&self) -> Result<usize> {
        self.snapshots.prune(&self.config.retention).await
    }

    /// Restore a snapshot onto the live table. Permitted while running or
    /// paused.
    pub async fn rollback(&self, id: &SnapshotId) -> Result<Arc<StandingsTable>> {
        if self.state() == AutomationState::Stopped {
            return Err(EngineError::AutomationStopped);
        }
        self.snapshots.restore(id).await
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    pub async fn health(&self) -> Result<SystemHealth> {
        let queue = self.queue_status().await;
        let history = self
            .storage
            .recent_history(self.config.history_limit)
            .await?;
        Ok(self
            .health
            .evaluate(self.state(), queue, &history, Utc::now()))
    }

    pub async fn history(
        &self,
        league: &str,
        limit: usize,
    ) -> Result<Vec<CalculationHistoryEntry>> {
        self.storage.history(league, limit).await
    }
}

/// Periodic `Scheduled` triggers for every known table.
struct Sweeper {
    queue: Arc<RwLock<JobQueue>>,
    notify: Arc<Notify>,
    games: Arc<dyn GameSource>,
    state: watch::Receiver<AutomationState>,
}

impl Sweeper {
    async fn run(self, period: std::time::Duration, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if *self.state.borrow() == AutomationState::Stopped {
                        continue;
                    }
                    if let Err(e) = sweep(&self.queue, &self.notify, self.games.as_ref()).await {
                        tracing::warn!(error = %e, "Scheduled sweep failed");
                    }
                }
            }
        }
    }
}

async fn sweep(
    queue: &RwLock<JobQueue>,
    notify: &Notify,
    games: &dyn GameSource,
) -> Result<usize> {
    let tables = games.tables().await?;
    let mut queue = queue.write().await;
    for key in &tables {
        queue.enqueue(CalculationTrigger::Scheduled { key: key.clone() }, None)?;
    }
    drop(queue);
    notify.notify_waiters();

    tracing::debug!(tables = tables.len(), "Scheduled sweep enqueued");
    Ok(tables.len())
}
