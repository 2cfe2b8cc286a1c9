use serde::{Deserialize, Serialize};

/// Identifies one standings table: a league in a given season.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableKey {
    pub league: String,
    pub season: String,
}

impl TableKey {
    pub fn new(league: impl Into<String>, season: impl Into<String>) -> Self {
        Self {
            league: league.into(),
            season: season.into(),
        }
    }
}

impl std::fmt::Display for TableKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.league, self.season)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    Completed,
    Cancelled,
}

/// A fixture as read from the game source. The engine never writes games.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub league: String,
    pub season: String,
    pub home: String,
    pub away: String,
    #[serde(default)]
    pub home_score: Option<u32>,
    #[serde(default)]
    pub away_score: Option<u32>,
    pub status: GameStatus,
}

impl Game {
    pub fn scheduled(
        id: impl Into<String>,
        key: &TableKey,
        home: impl Into<String>,
        away: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            league: key.league.clone(),
            season: key.season.clone(),
            home: home.into(),
            away: away.into(),
            home_score: None,
            away_score: None,
            status: GameStatus::Scheduled,
        }
    }

    pub fn completed(
        id: impl Into<String>,
        key: &TableKey,
        home: impl Into<String>,
        away: impl Into<String>,
        home_score: u32,
        away_score: u32,
    ) -> Self {
        Self {
            home_score: Some(home_score),
            away_score: Some(away_score),
            status: GameStatus::Completed,
            ..Self::scheduled(id, key, home, away)
        }
    }

    pub fn key(&self) -> TableKey {
        TableKey::new(self.league.clone(), self.season.clone())
    }

    /// Final score, if the game is completed and both sides were recorded.
    /// A half-entered result does not count as a 0-0 draw.
    pub fn final_score(&self) -> Option<(u32, u32)> {
        if self.status != GameStatus::Completed {
            return None;
        }
        match (self.home_score, self.away_score) {
            (Some(home), Some(away)) => Some((home, away)),
            _ => None,
        }
    }
}
