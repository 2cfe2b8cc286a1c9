use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::standings::{PointsRule, TieBreakPolicy};

/// How many snapshots to keep per (league, season).
///
/// The newest snapshot of every table survives pruning regardless of these
/// limits, so a league never loses its last rollback point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many snapshots per table (newest first).
    pub max_per_table: Option<usize>,
    /// Drop snapshots older than this many seconds.
    pub max_age_secs: Option<u64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_per_table: Some(20),
            max_age_secs: None,
        }
    }
}

impl RetentionPolicy {
    pub fn keep_last(count: usize) -> Self {
        Self {
            max_per_table: Some(count),
            max_age_secs: None,
        }
    }

    pub fn max_age(secs: u64) -> Self {
        Self {
            max_per_table: None,
            max_age_secs: Some(secs),
        }
    }
}

/// Thresholds the health monitor uses to derive a coarse status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Number of recent completed jobs averaged for the duration metric.
    pub duration_window: usize,
    /// Number of recent history entries inspected for failures and timeouts.
    pub failure_window: usize,
    /// Failed / total ratio in the failure window at which health degrades.
    pub degraded_failure_ratio: f64,
    /// Timeouts in the failure window (plus timed-out attempts of live jobs)
    /// at which health degrades.
    pub degraded_timeout_count: usize,
    /// Pending depth at which the system is unhealthy outright.
    pub unhealthy_queue_depth: usize,
    /// Number of depth samples that must grow monotonically to count as
    /// unbounded growth.
    pub growth_samples: usize,
    /// How often the controller records a depth sample.
    pub sample_interval_ms: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            duration_window: 20,
            failure_window: 20,
            degraded_failure_ratio: 0.25,
            degraded_timeout_count: 2,
            unhealthy_queue_depth: 500,
            growth_samples: 6,
            sample_interval_ms: 10_000,
        }
    }
}

/// Points and tie-break rules for one league.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableRules {
    pub points: PointsRule,
    pub tie_break: TieBreakPolicy,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker loops pulling from the queue. Must be at least 1.
    pub queue_concurrency: usize,
    pub max_retries: u32,
    /// Wall-clock bound for one execution attempt.
    pub job_timeout_ms: u64,
    /// Base delay before a retried job becomes eligible again.
    pub retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    /// How long an idle worker parks before re-checking the queue.
    pub poll_interval_ms: u64,
    /// Finished jobs kept in the queue for status queries.
    pub finished_job_limit: usize,
    /// Audit history entries kept by the in-memory store.
    pub history_limit: usize,
    /// Enqueue a `Scheduled` trigger for every known table on this interval.
    pub sweep_interval_secs: Option<u64>,
    pub retention: RetentionPolicy,
    pub health: HealthThresholds,
    pub default_rules: TableRules,
    pub league_rules: HashMap<String, TableRules>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_concurrency: 2,
            max_retries: 3,
            job_timeout_ms: 30_000,
            retry_backoff_ms: 500,
            max_retry_backoff_ms: 30_000,
            poll_interval_ms: 250,
            finished_job_limit: 500,
            history_limit: 10_000,
            sweep_interval_secs: None,
            retention: RetentionPolicy::default(),
            health: HealthThresholds::default(),
            default_rules: TableRules::default(),
            league_rules: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queue_concurrency == 0 {
            return Err(EngineError::InvalidConfig(
                "queue_concurrency must be at least 1".to_string(),
            ));
        }
        if self.job_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "job_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.sweep_interval_secs == Some(0) {
            return Err(EngineError::InvalidConfig(
                "sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.health.sample_interval_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "health.sample_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.retention.max_per_table == Some(0) {
            return Err(EngineError::InvalidConfig(
                "retention.max_per_table must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.queue_concurrency = workers;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_job_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.job_timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_league_rules(mut self, league: impl Into<String>, rules: TableRules) -> Self {
        self.league_rules.insert(league.into(), rules);
        self
    }

    /// Rules for `league`, falling back to the defaults.
    pub fn rules_for(&self, league: &str) -> TableRules {
        self.league_rules
            .get(league)
            .copied()
            .unwrap_or(self.default_rules)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn health_sample_interval(&self) -> Duration {
        Duration::from_millis(self.health.sample_interval_ms)
    }

    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = Some(secs);
        self
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// JSON file with games (and optional rosters) for the file-backed source.
    pub games_path: PathBuf,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            games_path: PathBuf::from("games.json"),
            engine: EngineConfig::default(),
        }
    }
}
