//! Persistence seams.
//!
//! The engine reads games through [`GameSource`] and keeps live tables,
//! snapshots and audit history behind [`Storage`]. Concrete schemas are the
//! implementor's concern; [`MemoryStorage`] and [`MemoryGameSource`] back tests
//! and single-process deployments, [`JsonGameSource`] reads a games file.

pub mod json;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::history::CalculationHistoryEntry;
use crate::snapshot::{Snapshot, SnapshotId, SnapshotMeta};
use crate::standings::{Game, StandingsTable, TableKey};

pub use json::JsonGameSource;
pub use memory::{MemoryGameSource, MemoryStorage};

/// Read-only access to the games the tables are computed from.
#[async_trait]
pub trait GameSource: Send + Sync {
    /// Every game of one league and season, in any order.
    async fn games(&self, key: &TableKey) -> Result<Vec<Game>>;

    /// Expected participants, when the source knows them.
    async fn roster(&self, key: &TableKey) -> Result<Option<Vec<String>>>;

    /// Tables the source has games for.
    async fn tables(&self) -> Result<Vec<TableKey>>;
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn live_table(&self, key: &TableKey) -> Result<Option<Arc<StandingsTable>>>;

    /// Atomically replace the live table for `table.key`, returning the
    /// previous one. Readers see either the old or the new table, never a mix.
    async fn replace_live_table(
        &self,
        table: Arc<StandingsTable>,
    ) -> Result<Option<Arc<StandingsTable>>>;

    async fn insert_snapshot(&self, snapshot: Snapshot) -> Result<()>;

    async fn snapshot(&self, id: &SnapshotId) -> Result<Option<Snapshot>>;

    /// Snapshot metadata for one table, oldest first.
    async fn snapshots_for(&self, key: &TableKey) -> Result<Vec<SnapshotMeta>>;

    /// Snapshot metadata for every table, oldest first.
    async fn all_snapshot_meta(&self) -> Result<Vec<SnapshotMeta>>;

    /// Returns false if no snapshot had this id.
    async fn remove_snapshot(&self, id: &SnapshotId) -> Result<bool>;

    async fn append_history(&self, entry: CalculationHistoryEntry) -> Result<()>;

    /// History for one league (all seasons), newest first.
    async fn history(&self, league: &str, limit: usize) -> Result<Vec<CalculationHistoryEntry>>;

    /// History across all leagues, newest first.
    async fn recent_history(&self, limit: usize) -> Result<Vec<CalculationHistoryEntry>>;
}
