use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::CalculationTrigger;
use crate::standings::TableKey;

/// One row of a standings table. Derived, never hand-edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub rank: u32,
    pub team: String,
    pub played: u32,
    pub won: u32,
    pub drawn: u32,
    pub lost: u32,
    pub goals_for: u32,
    pub goals_against: u32,
    pub goal_difference: i64,
    pub points: u32,
}

impl TableEntry {
    pub fn new(team: impl Into<String>) -> Self {
        Self {
            rank: 0,
            team: team.into(),
            played: 0,
            won: 0,
            drawn: 0,
            lost: 0,
            goals_for: 0,
            goals_against: 0,
            goal_difference: 0,
            points: 0,
        }
    }
}

/// A ranked table for one (league, season).
///
/// Immutable once produced: a recalculation builds a new value and the live
/// table is swapped as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandingsTable {
    pub key: TableKey,
    pub entries: Vec<TableEntry>,
    pub computed_at: DateTime<Utc>,
    pub trigger: CalculationTrigger,
}

impl StandingsTable {
    pub fn new(key: TableKey, entries: Vec<TableEntry>, trigger: CalculationTrigger) -> Self {
        Self {
            key,
            entries,
            computed_at: Utc::now(),
            trigger,
        }
    }

    pub fn entry(&self, team: &str) -> Option<&TableEntry> {
        self.entries.iter().find(|e| e.team == team)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
