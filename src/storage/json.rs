use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::standings::{Game, TableKey};
use crate::storage::GameSource;

/// Expected participants of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterSpec {
    pub league: String,
    pub season: String,
    pub teams: Vec<String>,
}

/// On-disk layout: either a bare array of games, or a document with games
/// and rosters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum GamesFileRepr {
    Document {
        games: Vec<Game>,
        #[serde(default)]
        rosters: Vec<RosterSpec>,
    },
    List(Vec<Game>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GamesFile {
    pub games: Vec<Game>,
    pub rosters: Vec<RosterSpec>,
}

impl GamesFile {
    pub fn games_for(&self, key: &TableKey) -> Vec<Game> {
        self.games
            .iter()
            .filter(|g| g.league == key.league && g.season == key.season)
            .cloned()
            .collect()
    }

    pub fn roster_for(&self, key: &TableKey) -> Option<Vec<String>> {
        self.rosters
            .iter()
            .find(|r| r.league == key.league && r.season == key.season)
            .map(|r| r.teams.clone())
    }
}

/// [`GameSource`] over a JSON file, re-read on every call so edits are
/// picked up by the next job.
#[derive(Debug, Clone)]
pub struct JsonGameSource {
    path: PathBuf,
}

impl JsonGameSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<GamesFile> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let repr: GamesFileRepr = serde_json::from_str(&raw)?;
        Ok(match repr {
            GamesFileRepr::Document { games, rosters } => GamesFile { games, rosters },
            GamesFileRepr::List(games) => GamesFile {
                games,
                rosters: Vec::new(),
            },
        })
    }

    /// Read failures may be transient and are retried; a malformed file is not.
    async fn load_for_job(&self) -> Result<GamesFile> {
        self.load().await.map_err(|e| match e {
            EngineError::Io(err) => EngineError::StorageError(format!(
                "reading {}: {}",
                self.path.display(),
                err
            )),
            EngineError::Serialization(err) => EngineError::InvalidInput(format!(
                "parsing {}: {}",
                self.path.display(),
                err
            )),
            other => other,
        })
    }
}

#[async_trait]
impl GameSource for JsonGameSource {
    async fn games(&self, key: &TableKey) -> Result<Vec<Game>> {
        Ok(self.load_for_job().await?.games_for(key))
    }

    async fn roster(&self, key: &TableKey) -> Result<Option<Vec<String>>> {
        Ok(self.load_for_job().await?.roster_for(key))
    }

    async fn tables(&self) -> Result<Vec<TableKey>> {
        let file = self.load_for_job().await?;
        let keys: BTreeSet<TableKey> = file.games.iter().map(Game::key).collect();
        Ok(keys.into_iter().collect())
    }
}
