//! League standings: the game data the engine reads and the tables it derives.
//!
//! - [`Game`]: one fixture between two participants, owned by the game source
//! - [`StandingsTable`]: an immutable, ranked table for one (league, season)
//! - [`compute`]: the pure calculator turning games into ranked entries

pub mod calculator;
pub mod game;
pub mod table;

pub use calculator::{compute, PointsRule, TieBreakPolicy};
pub use game::{Game, GameStatus, TableKey};
pub use table::{StandingsTable, TableEntry};
