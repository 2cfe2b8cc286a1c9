use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::history::CalculationHistoryEntry;
use crate::snapshot::{Snapshot, SnapshotId, SnapshotMeta};
use crate::standings::{Game, StandingsTable, TableKey};
use crate::storage::{GameSource, Storage};

const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// In-process [`Storage`].
///
/// Live tables are held as `Arc`s, so replacing one is a pointer swap under
/// the write lock.
#[derive(Debug)]
pub struct MemoryStorage {
    live: RwLock<HashMap<TableKey, Arc<StandingsTable>>>,
    /// Insertion ordered.
    snapshots: RwLock<Vec<Snapshot>>,
    history: RwLock<VecDeque<CalculationHistoryEntry>>,
    history_limit: usize,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            history_limit,
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn live_table(&self, key: &TableKey) -> Result<Option<Arc<StandingsTable>>> {
        Ok(self.live.read().await.get(key).cloned())
    }

    async fn replace_live_table(
        &self,
        table: Arc<StandingsTable>,
    ) -> Result<Option<Arc<StandingsTable>>> {
        let mut live = self.live.write().await;
        Ok(live.insert(table.key.clone(), table))
    }

    async fn insert_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.snapshots.write().await.push(snapshot);
        Ok(())
    }

    async fn snapshot(&self, id: &SnapshotId) -> Result<Option<Snapshot>> {
        Ok(self
            .snapshots
            .read()
            .await
            .iter()
            .find(|s| &s.id == id)
            .cloned())
    }

    async fn snapshots_for(&self, key: &TableKey) -> Result<Vec<SnapshotMeta>> {
        Ok(self
            .snapshots
            .read()
            .await
            .iter()
            .filter(|s| &s.key == key)
            .map(Snapshot::meta)
            .collect())
    }

    async fn all_snapshot_meta(&self) -> Result<Vec<SnapshotMeta>> {
        Ok(self.snapshots.read().await.iter().map(Snapshot::meta).collect())
    }

    async fn remove_snapshot(&self, id: &SnapshotId) -> Result<bool> {
        let mut snapshots = self.snapshots.write().await;
        let before = snapshots.len();
        snapshots.retain(|s| &s.id != id);
        Ok(snapshots.len() != before)
    }

    async fn append_history(&self, entry: CalculationHistoryEntry) -> Result<()> {
        let mut history = self.history.write().await;
        history.push_back(entry);
        while history.len() > self.history_limit {
            history.pop_front();
        }
        Ok(())
    }

    async fn history(&self, league: &str, limit: usize) -> Result<Vec<CalculationHistoryEntry>> {
        Ok(self
            .history
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| e.key.league == league)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn recent_history(&self, limit: usize) -> Result<Vec<CalculationHistoryEntry>> {
        Ok(self
            .history
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

/// In-process [`GameSource`] that callers edit directly.
#[derive(Debug, Default)]
pub struct MemoryGameSource {
    games: RwLock<BTreeMap<TableKey, Vec<Game>>>,
    rosters: RwLock<HashMap<TableKey, Vec<String>>>,
}

impl MemoryGameSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_games(games: Vec<Game>) -> Self {
        let source = Self::new();
        for game in games {
            source.upsert_game(game).await;
        }
        source
    }

    /// Insert a game, or replace the game with the same id in its table.
    pub async fn upsert_game(&self, game: Game) {
        let mut games = self.games.write().await;
        let table = games.entry(game.key()).or_default();
        match table.iter_mut().find(|g| g.id == game.id) {
            Some(existing) => *existing = game,
            None => table.push(game),
        }
    }

    pub async fn remove_game(&self, key: &TableKey, game_id: &str) -> Option<Game> {
        let mut games = self.games.write().await;
        let table = games.get_mut(key)?;
        let index = table.iter().position(|g| g.id == game_id)?;
        Some(table.remove(index))
    }

    pub async fn set_roster(&self, key: TableKey, teams: Vec<String>) {
        self.rosters.write().await.insert(key, teams);
    }
}

#[async_trait]
impl GameSource for MemoryGameSource {
    async fn games(&self, key: &TableKey) -> Result<Vec<Game>> {
        Ok(self.games.read().await.get(key).cloned().unwrap_or_default())
    }

    async fn roster(&self, key: &TableKey) -> Result<Option<Vec<String>>> {
        Ok(self.rosters.read().await.get(key).cloned())
    }

    async fn tables(&self) -> Result<Vec<TableKey>> {
        Ok(self
            .games
            .read()
            .await
            .iter()
            .filter(|(_, games)| !games.is_empty())
            .map(|(key, _)| key.clone())
            .collect())
    }
}
