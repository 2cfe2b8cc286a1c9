use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::TableRules;
use crate::error::{EngineError, Result};
use crate::standings::{Game, TableEntry};

/// Points awarded per result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsRule {
    pub win: u32,
    pub draw: u32,
    pub loss: u32,
}

impl Default for PointsRule {
    fn default() -> Self {
        Self {
            win: 3,
            draw: 1,
            loss: 0,
        }
    }
}

/// What breaks a tie after points, goal difference and goals scored.
///
/// Whatever the policy, the team name is the last criterion, so ranks never
/// depend on the order games were read in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakPolicy {
    /// Points, goal difference, goals for, name.
    Standard,
    /// As `Standard`, with a mini-table over the games played among the tied
    /// teams (points, goal difference, goals for) before the name.
    #[default]
    HeadToHead,
}

/// Compute ranked table entries from every game of one league and season.
///
/// Only completed games with both scores recorded count. Participants of
/// scheduled games and every roster member get a row even without results.
///
/// # Errors
///
/// - [`EngineError::EmptyInput`] when `games` is empty
/// - [`EngineError::InvalidInput`] when games span several tables, a team
///   plays itself, or a participant is missing from `roster`
pub fn compute(
    games: &[Game],
    roster: Option<&[String]>,
    rules: &TableRules,
) -> Result<Vec<TableEntry>> {
    let first = games.first().ok_or(EngineError::EmptyInput)?;
    let roster: Option<BTreeSet<&str>> = roster.map(|r| r.iter().map(String::as_str).collect());

    let mut rows: BTreeMap<&str, TableEntry> = BTreeMap::new();
    if let Some(roster) = &roster {
        for team in roster {
            rows.insert(*team, TableEntry::new(*team));
        }
    }

    for game in games {
        if game.league != first.league || game.season != first.season {
            return Err(EngineError::InvalidInput(format!(
                "game {} belongs to {}/{}, expected {}/{}",
                game.id, game.league, game.season, first.league, first.season
            )));
        }
        if game.home == game.away {
            return Err(EngineError::InvalidInput(format!(
                "game {} has {} playing itself",
                game.id, game.home
            )));
        }
        for team in [game.home.as_str(), game.away.as_str()] {
            if let Some(roster) = &roster {
                if !roster.contains(team) {
                    return Err(EngineError::InvalidInput(format!(
                        "game {} references {} which is not in the {} roster",
                        game.id, team, game.league
                    )));
                }
            }
            rows.entry(team).or_insert_with(|| TableEntry::new(team));
        }

        let Some((home_goals, away_goals)) = game.final_score() else {
            continue;
        };
        if let Some(home) = rows.get_mut(game.home.as_str()) {
            record_result(home, home_goals, away_goals, &rules.points);
        }
        if let Some(away) = rows.get_mut(game.away.as_str()) {
            record_result(away, away_goals, home_goals, &rules.points);
        }
    }

    let mut entries: Vec<TableEntry> = rows.into_values().collect();
    entries.sort_by(|a, b| primary_order(a, b).then_with(|| a.team.cmp(&b.team)));

    if rules.tie_break == TieBreakPolicy::HeadToHead {
        apply_head_to_head(&mut entries, games, &rules.points);
    }

    for (index, entry) in entries.iter_mut().enumerate() {
        entry.rank = index as u32 + 1;
    }
    Ok(entries)
}

fn record_result(entry: &mut TableEntry, scored: u32, conceded: u32, points: &PointsRule) {
    entry.played += 1;
    entry.goals_for = entry.goals_for.saturating_add(scored);
    entry.goals_against = entry.goals_against.saturating_add(conceded);
    entry.goal_difference = entry.goals_for as i64 - entry.goals_against as i64;
    match scored.cmp(&conceded) {
        Ordering::Greater => {
            entry.won += 1;
            entry.points = entry.points.saturating_add(points.win);
        }
        Ordering::Equal => {
            entry.drawn += 1;
            entry.points = entry.points.saturating_add(points.draw);
        }
        Ordering::Less => {
            entry.lost += 1;
            entry.points = entry.points.saturating_add(points.loss);
        }
    }
}

/// Points, goal difference, goals for; all descending.
fn primary_order(a: &TableEntry, b: &TableEntry) -> Ordering {
    b.points
        .cmp(&a.points)
        .then_with(|| b.goal_difference.cmp(&a.goal_difference))
        .then_with(|| b.goals_for.cmp(&a.goals_for))
}

/// Re-order every run of entries tied on the primary criteria by the
/// mini-table of games played among them.
fn apply_head_to_head(entries: &mut [TableEntry], games: &[Game], points: &PointsRule) {
    let mut start = 0;
    while start < entries.len() {
        let mut end = start + 1;
        while end < entries.len() && primary_order(&entries[start], &entries[end]).is_eq() {
            end += 1;
        }
        if end - start > 1 {
            let group = &mut entries[start..end];
            let mini = mini_table(group, games, points);
            group.sort_by(|a, b| {
                let (a_pts, a_gd, a_gf) = mini.get(a.team.as_str()).copied().unwrap_or_default();
                let (b_pts, b_gd, b_gf) = mini.get(b.team.as_str()).copied().unwrap_or_default();
                b_pts
                    .cmp(&a_pts)
                    .then_with(|| b_gd.cmp(&a_gd))
                    .then_with(|| b_gf.cmp(&a_gf))
                    .then_with(|| a.team.cmp(&b.team))
            });
        }
        start = end;
    }
}

/// (points, goal difference, goals for) per team, counting only games where
/// both sides belong to `group`.
fn mini_table(
    group: &[TableEntry],
    games: &[Game],
    points: &PointsRule,
) -> BTreeMap<String, (u32, i64, u32)> {
    let members: BTreeSet<&str> = group.iter().map(|e| e.team.as_str()).collect();
    let mut mini: BTreeMap<String, (u32, i64, u32)> = BTreeMap::new();

    for game in games {
        if !members.contains(game.home.as_str()) || !members.contains(game.away.as_str()) {
            continue;
        }
        let Some((home_goals, away_goals)) = game.final_score() else {
            continue;
        };
        for (team, scored, conceded) in [
            (&game.home, home_goals, away_goals),
            (&game.away, away_goals, home_goals),
        ] {
            let row = mini.entry(team.clone()).or_default();
            row.0 = row.0.saturating_add(match scored.cmp(&conceded) {
                Ordering::Greater => points.win,
                Ordering::Equal => points.draw,
                Ordering::Less => points.loss,
            });
            row.1 += scored as i64 - conceded as i64;
            row.2 = row.2.saturating_add(scored);
        }
    }
    mini
}
