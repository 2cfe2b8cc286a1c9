//! Health reporting.
//!
//! Everything here is derived from queue status and calculation history at
//! the time of the call. The only state the monitor keeps is a short ring of
//! queue depth samples used to detect sustained growth.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::HealthThresholds;
use crate::controller::AutomationState;
use crate::history::CalculationHistoryEntry;
use crate::scheduler::QueueStatus;
use crate::standings::TableKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableFreshness {
    pub key: TableKey,
    pub last_success_at: DateTime<Utc>,
    pub seconds_since_success: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    /// Human-readable causes for a non-healthy status.
    pub reasons: Vec<String>,
    pub automation: AutomationState,
    pub queue: QueueStatus,
    /// Moving average over the most recent completed jobs.
    pub avg_duration_ms: Option<f64>,
    pub recent_failures: usize,
    pub recent_timeouts: usize,
    pub failure_ratio: f64,
    /// Most recent successful job per table, most recently refreshed first.
    pub last_success: Vec<TableFreshness>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    samples: Mutex<VecDeque<usize>>,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(thresholds.growth_samples)),
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Record one pending-depth sample, keeping the last `growth_samples`.
    pub fn record_depth(&self, depth: usize) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.push_back(depth);
        while samples.len() > self.thresholds.growth_samples.max(1) {
            samples.pop_front();
        }
    }

    /// True when the sample window is full and every sample exceeds the one
    /// before it.
    pub fn depth_growing(&self) -> bool {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        let window = self.thresholds.growth_samples;
        window >= 2
            && samples.len() >= window
            && samples
                .iter()
                .zip(samples.iter().skip(1))
                .all(|(prev, next)| next > prev)
    }

    /// Build a report. `history` must be newest first.
    pub fn evaluate(
        &self,
        automation: AutomationState,
        queue: QueueStatus,
        history: &[CalculationHistoryEntry],
        now: DateTime<Utc>,
    ) -> SystemHealth {
        let t = &self.thresholds;
        // Rollbacks are not job executions.
        let jobs: Vec<&CalculationHistoryEntry> =
            history.iter().filter(|e| e.job_id.is_some()).collect();

        let durations: Vec<i64> = jobs
            .iter()
            .filter(|e| e.is_success())
            .take(t.duration_window)
            .map(|e| e.duration_ms)
            .collect();
        let avg_duration_ms = if durations.is_empty() {
            None
        } else {
            Some(durations.iter().sum::<i64>() as f64 / durations.len() as f64)
        };

        let window: Vec<&&CalculationHistoryEntry> = jobs.iter().take(t.failure_window).collect();
        let recent_failures = window.iter().filter(|e| !e.is_success()).count();
        let recent_timeouts = window.iter().filter(|e| e.is_timeout()).count();
        let failure_ratio = if window.is_empty() {
            0.0
        } else {
            recent_failures as f64 / window.len() as f64
        };

        let mut seen: HashSet<&TableKey> = HashSet::new();
        let mut last_success = Vec::new();
        for entry in jobs.iter().filter(|e| e.is_success()) {
            if seen.insert(&entry.key) {
                last_success.push(TableFreshness {
                    key: entry.key.clone(),
                    last_success_at: entry.finished_at,
                    seconds_since_success: (now - entry.finished_at).num_seconds(),
                });
            }
        }

        let mut reasons = Vec::new();
        let mut status = HealthStatus::Healthy;

        if queue.pending >= t.unhealthy_queue_depth {
            status = HealthStatus::Unhealthy;
            reasons.push(format!(
                "queue depth {} at or above {}",
                queue.pending, t.unhealthy_queue_depth
            ));
        }
        if self.depth_growing() {
            status = HealthStatus::Unhealthy;
            reasons.push(format!(
                "queue depth grew across the last {} samples",
                t.growth_samples
            ));
        }

        let timeouts = recent_timeouts + queue.timed_out_attempts;
        if timeouts >= t.degraded_timeout_count {
            status = worse(status, HealthStatus::Degraded);
            reasons.push(format!("{} recent timeouts", timeouts));
        }
        if !window.is_empty() && failure_ratio >= t.degraded_failure_ratio {
            status = worse(status, HealthStatus::Degraded);
            reasons.push(format!(
                "{} of the last {} jobs failed",
                recent_failures,
                window.len()
            ));
        }

        SystemHealth {
            status,
            reasons,
            automation,
            queue,
            avg_duration_ms,
            recent_failures,
            recent_timeouts,
            failure_ratio,
            last_success,
            checked_at: now,
        }
    }
}

fn worse(current: HealthStatus, candidate: HealthStatus) -> HealthStatus {
    match (current, candidate) {
        (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
        (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    }
}
