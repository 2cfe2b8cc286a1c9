//! Point-in-time copies of live tables, used for rollback.
//!
//! The processor saves the current live table right before a job replaces
//! it. Restoring a snapshot swaps its table back in verbatim; nothing is
//! recomputed.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RetentionPolicy;
use crate::error::{EngineError, Result};
use crate::history::{self, CalculationHistoryEntry};
use crate::scheduler::CalculationTrigger;
use crate::standings::{StandingsTable, TableKey};
use crate::storage::Storage;

pub type SnapshotId = Uuid;

const HISTORY_APPEND_ATTEMPTS: u32 = 3;
const HISTORY_APPEND_PAUSE: std::time::Duration = std::time::Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub key: TableKey,
    pub table: StandingsTable,
    /// The trigger of the job that was about to replace `table`.
    pub reason: CalculationTrigger,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(table: StandingsTable, reason: CalculationTrigger) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: table.key.clone(),
            table,
            reason,
            created_at: Utc::now(),
        }
    }

    pub fn meta(&self) -> SnapshotMeta {
        SnapshotMeta {
            id: self.id,
            key: self.key.clone(),
            reason: self.reason.clone(),
            created_at: self.created_at,
            table_computed_at: self.table.computed_at,
            entries: self.table.entries.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: SnapshotId,
    pub key: TableKey,
    pub reason: CalculationTrigger,
    pub created_at: DateTime<Utc>,
    pub table_computed_at: DateTime<Utc>,
    pub entries: usize,
}

/// Snapshot operations over a [`Storage`].
#[derive(Clone)]
pub struct SnapshotStore {
    storage: Arc<dyn Storage>,
}

impl SnapshotStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn save(
        &self,
        table: &StandingsTable,
        reason: CalculationTrigger,
    ) -> Result<SnapshotId> {
        let snapshot = Snapshot::new(table.clone(), reason);
        let id = snapshot.id;
        self.storage.insert_snapshot(snapshot).await?;
        tracing::debug!(snapshot_id = %id, table = %table.key, "Snapshot saved");
        Ok(id)
    }

    /// Snapshots of one table, newest first.
    pub async fn list(&self, key: &TableKey) -> Result<Vec<SnapshotMeta>> {
        let mut metas = self.storage.snapshots_for(key).await?;
        metas.reverse();
        Ok(metas)
    }

    pub async fn snapshot(&self, id: &SnapshotId) -> Result<Snapshot> {
        self.storage
            .snapshot(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("snapshot {}", id)))
    }

    pub async fn get(&self, id: &SnapshotId) -> Result<StandingsTable> {
        Ok(self.snapshot(id).await?.table)
    }

    /// Make the snapshot's table the live table again and record the
    /// rollback in history.
    pub async fn restore(&self, id: &SnapshotId) -> Result<Arc<StandingsTable>> {
        let started_at = Utc::now();
        let snapshot = self.snapshot(id).await?;
        let table = Arc::new(snapshot.table);

        self.storage.replace_live_table(table.clone()).await?;

        // The swap above commits the rollback.
        let entry = CalculationHistoryEntry::for_rollback(
            snapshot.key.clone(),
            *id,
            started_at,
            table.entries.len(),
        );
        if let Err(e) = history::append_with_retry(
            self.storage.as_ref(),
            entry,
            HISTORY_APPEND_ATTEMPTS,
            HISTORY_APPEND_PAUSE,
        )
        .await
        {
            tracing::error!(snapshot_id = %id, table = %snapshot.key, error = %e, "Failed to record rollback in history");
        }

        tracing::info!(snapshot_id = %id, table = %snapshot.key, "Snapshot restored");
        Ok(table)
    }

    pub async fn delete(&self, id: &SnapshotId) -> Result<()> {
        if self.storage.remove_snapshot(id).await? {
            tracing::debug!(snapshot_id = %id, "Snapshot deleted");
            Ok(())
        } else {
            Err(EngineError::NotFound(format!("snapshot {}", id)))
        }
    }

    /// Apply `policy` to every table. Returns the number of snapshots removed.
    pub async fn prune(&self, policy: &RetentionPolicy) -> Result<usize> {
        let metas = self.storage.all_snapshot_meta().await?;
        self.remove_all(prunable(&metas, policy, Utc::now())).await
    }

    /// Apply `policy` to one table.
    pub async fn prune_table(&self, key: &TableKey, policy: &RetentionPolicy) -> Result<usize> {
        let metas = self.storage.snapshots_for(key).await?;
        self.remove_all(prunable(&metas, policy, Utc::now())).await
    }

    async fn remove_all(&self, ids: Vec<SnapshotId>) -> Result<usize> {
        let mut removed = 0;
        for id in ids {
            if self.storage.remove_snapshot(&id).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Snapshots pruned");
        }
        Ok(removed)
    }
}

/// Snapshots `policy` allows removing. `metas` must be oldest first.
///
/// The newest snapshot of each table is never selected.
pub fn prunable(
    metas: &[SnapshotMeta],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<SnapshotId> {
    let mut by_table: HashMap<&TableKey, Vec<&SnapshotMeta>> = HashMap::new();
    for meta in metas {
        by_table.entry(&meta.key).or_default().push(meta);
    }

    let max_age = policy
        .max_age_secs
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(Duration::try_seconds);

    let mut doomed = Vec::new();
    for table in by_table.values() {
        // Position 0 is the newest and always survives.
        for (position, meta) in table.iter().rev().enumerate().skip(1) {
            let over_count = policy.max_per_table.is_some_and(|max| position >= max);
            let too_old = max_age.is_some_and(|age| now - meta.created_at > age);
            if over_count || too_old {
                doomed.push(meta.id);
            }
        }
    }
    doomed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(key: &TableKey, age_secs: i64, now: DateTime<Utc>) -> SnapshotMeta {
        SnapshotMeta {
            id: Uuid::new_v4(),
            key: key.clone(),
            reason: CalculationTrigger::Scheduled { key: key.clone() },
            created_at: now - Duration::seconds(age_secs),
            table_computed_at: now - Duration::seconds(age_secs),
            entries: 4,
        }
    }

    #[test]
    fn count_policy_keeps_newest() {
        let now = Utc::now();
        let key = TableKey::new("kreisliga-a", "2024-25");
        let metas: Vec<SnapshotMeta> = (0..5).rev().map(|age| meta(&key, age, now)).collect();

        let doomed = prunable(&metas, &RetentionPolicy::keep_last(2), now);

        assert_eq!(doomed.len(), 3);
        assert!(!doomed.contains(&metas[4].id));
        assert!(!doomed.contains(&metas[3].id));
    }

    #[test]
    fn age_policy_never_removes_last_snapshot() {
        let now = Utc::now();
        let key = TableKey::new("kreisliga-a", "2024-25");
        let metas = vec![meta(&key, 7200, now), meta(&key, 3600, now)];

        let doomed = prunable(&metas, &RetentionPolicy::max_age(60), now);

        assert_eq!(doomed, vec![metas[0].id]);
    }

    #[test]
    fn tables_are_pruned_independently() {
        let now = Utc::now();
        let a = TableKey::new("kreisliga-a", "2024-25");
        let b = TableKey::new("kreisliga-b", "2024-25");
        let metas = vec![meta(&a, 30, now), meta(&b, 20, now), meta(&a, 10, now)];

        let doomed = prunable(&metas, &RetentionPolicy::keep_last(1), now);

        assert_eq!(doomed, vec![metas[0].id]);
    }
}
