//! Turns a parsed race into a write plan against what is already stored.
//!
//! Nothing here touches the network or the database; the engine feeds in the
//! persisted results and hands the plan's commit to the store.

use std::collections::{BTreeMap, HashMap, HashSet};

use peloton_adapters::ParsedRace;
use peloton_core::{
    estimate_numbers, normalize, CategoryFilter, Cyclist, NormalizedEntrant, Race, RaceResult,
};
use peloton_storage::{PersistedResult, RaceCommit};
use serde::Serialize;
use tracing::debug;

/// An eligible entrant with the number it will be stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredEntrant {
    pub entrant: NormalizedEntrant,
    pub rank: u32,
    pub rank_estimated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreparedRace {
    pub entrants: Vec<ScoredEntrant>,
    pub rows_dropped: usize,
    pub rows_filtered: usize,
    pub duplicates: usize,
}

/// Normalize, filter by category, drop repeated sightings, then number
/// whoever has no published position.
pub fn prepare_entrants(parsed: &ParsedRace, filter: &CategoryFilter) -> PreparedRace {
    let mut prepared = PreparedRace::default();
    let mut seen = HashSet::new();
    let mut eligible = Vec::new();

    for row in &parsed.rows {
        let entrant = match normalize(row) {
            Ok(entrant) => entrant,
            Err(reason) => {
                debug!(race_id = %parsed.race_id, %reason, "row dropped");
                prepared.rows_dropped += 1;
                continue;
            }
        };
        if !filter.is_eligible(&entrant.category) {
            prepared.rows_filtered += 1;
            continue;
        }
        if !seen.insert(entrant.cyclist_id.clone()) {
            prepared.duplicates += 1;
            continue;
        }
        eligible.push(entrant);
    }

    let highest_explicit = eligible.iter().filter_map(|e| e.rank).max().unwrap_or(0);
    let numberless: Vec<NormalizedEntrant> = eligible
        .iter()
        .filter(|e| e.rank.is_none())
        .cloned()
        .collect();
    let estimates: HashMap<_, _> = estimate_numbers(&numberless, parsed.organizer_club.as_deref())
        .into_iter()
        .collect();

    prepared.entrants = eligible
        .into_iter()
        .map(|entrant| {
            let (rank, rank_estimated) = match entrant.rank {
                Some(rank) => (rank, false),
                None => {
                    let estimate = estimates.get(&entrant.cyclist_id).copied().unwrap_or(0);
                    (highest_explicit + estimate, true)
                }
            };
            ScoredEntrant {
                entrant,
                rank,
                rank_estimated,
            }
        })
        .collect();
    prepared
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceState {
    New,
    Existing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultAction {
    Insert,
    Update { previous_rank: u32 },
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedResult {
    pub result: RaceResult,
    pub action: ResultAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RacePlan {
    pub race: Race,
    pub state: RaceState,
    pub cyclists: Vec<Cyclist>,
    pub results: Vec<PlannedResult>,
    /// Stored results this scrape no longer lists; they are kept as is.
    pub retained: usize,
}

impl RacePlan {
    pub fn inserts(&self) -> usize {
        self.count(|action| action == ResultAction::Insert)
    }

    pub fn updates(&self) -> usize {
        self.count(|action| matches!(action, ResultAction::Update { .. }))
    }

    pub fn unchanged(&self) -> usize {
        self.count(|action| action == ResultAction::Unchanged)
    }

    fn count(&self, wanted: impl Fn(ResultAction) -> bool) -> usize {
        self.results.iter().filter(|r| wanted(r.action)).count()
    }

    /// Race row and cyclists are always written so better club or region
    /// values reach the store; only new or changed results are.
    pub fn into_commit(self) -> RaceCommit {
        RaceCommit {
            race: self.race,
            cyclists: self.cyclists,
            results: self
                .results
                .into_iter()
                .filter(|planned| planned.action != ResultAction::Unchanged)
                .map(|planned| planned.result)
                .collect(),
        }
    }
}

pub fn plan_race(
    race: Race,
    entrants: &[ScoredEntrant],
    persisted: Option<&BTreeMap<String, PersistedResult>>,
) -> RacePlan {
    let state = if persisted.is_some() {
        RaceState::Existing
    } else {
        RaceState::New
    };

    let results: Vec<PlannedResult> = entrants
        .iter()
        .map(|scored| {
            let result = RaceResult {
                race_id: race.id.clone(),
                cyclist_id: scored.entrant.cyclist_id.clone(),
                rank: scored.rank,
                rank_estimated: scored.rank_estimated,
                raw_data: scored.entrant.raw_cells.clone(),
            };
            let known = persisted.and_then(|stored| stored.get(result.cyclist_id.as_str()));
            let action = match known {
                None => ResultAction::Insert,
                Some(previous)
                    if previous.rank != result.rank
                        || previous.rank_estimated != result.rank_estimated =>
                {
                    ResultAction::Update {
                        previous_rank: previous.rank,
                    }
                }
                Some(_) => ResultAction::Unchanged,
            };
            PlannedResult { result, action }
        })
        .collect();

    let retained = persisted
        .map(|stored| {
            stored
                .keys()
                .filter(|id| {
                    !entrants
                        .iter()
                        .any(|scored| scored.entrant.cyclist_id.as_str() == id.as_str())
                })
                .count()
        })
        .unwrap_or(0);

    RacePlan {
        cyclists: entrants.iter().map(|s| s.entrant.to_cyclist()).collect(),
        race,
        state,
        results,
        retained,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use peloton_core::RawRow;

    use super::*;

    fn row(position: &str, id: &str, last: &str, club: &str, category: &str) -> RawRow {
        RawRow {
            position: position.into(),
            id: id.into(),
            last_name: last.into(),
            first_name: "Alex".into(),
            club: club.into(),
            category: category.into(),
            cells: vec![position.into(), id.into(), last.into()],
            ..RawRow::default()
        }
    }

    fn parsed(rows: Vec<RawRow>, organizer: Option<&str>) -> ParsedRace {
        ParsedRace {
            race_id: "race_x".into(),
            date: NaiveDate::from_ymd_opt(2024, 6, 1).expect("date"),
            name: "Prix X".into(),
            organizer_club: organizer.map(str::to_string),
            rows,
            short_rows: 0,
        }
    }

    fn race() -> Race {
        Race {
            id: "race_x".into(),
            source_id: "pdl".into(),
            url: "https://x.test/resultats/x/".into(),
            date: NaiveDate::from_ymd_opt(2024, 6, 1).expect("date"),
            name: "Prix X".into(),
        }
    }

    #[test]
    fn estimates_follow_the_last_published_position() {
        let prepared = prepare_entrants(
            &parsed(
                vec![
                    row("1", "10", "A", "UC Cholet", "Open 1"),
                    row("2", "11", "B", "UC Cholet", "Open 1"),
                    row("", "12", "C", "AC Laval", "Open 2"),
                    row("", "13", "D", "VC Angers", "Open 2"),
                ],
                Some("VC Angers"),
            ),
            &CategoryFilter::default(),
        );

        let ranks: Vec<_> = prepared
            .entrants
            .iter()
            .map(|s| (s.entrant.cyclist_id.as_str(), s.rank, s.rank_estimated))
            .collect();
        assert_eq!(
            ranks,
            vec![
                ("10", 1, false),
                ("11", 2, false),
                ("12", 4, true),
                ("13", 3, true),
            ]
        );
    }

    #[test]
    fn ineligible_invalid_and_repeated_rows_are_counted_not_kept() {
        let prepared = prepare_entrants(
            &parsed(
                vec![
                    row("1", "10", "A", "", "Open 1"),
                    row("2", "10", "A", "", "Open 1"),
                    row("3", "11", "B", "", "Elite"),
                    RawRow {
                        first_name: String::new(),
                        ..row("4", "12", "", "", "Open 1")
                    },
                    row("", "", "Nom", "", "Open 1"),
                ],
                None,
            ),
            &CategoryFilter::default(),
        );
        assert_eq!(prepared.entrants.len(), 1);
        assert_eq!(prepared.entrants[0].rank, 1);
        assert_eq!(prepared.duplicates, 1);
        assert_eq!(prepared.rows_filtered, 1);
        assert_eq!(prepared.rows_dropped, 2);
    }

    #[test]
    fn existing_race_plans_inserts_updates_and_keeps_history() {
        let prepared = prepare_entrants(
            &parsed(
                vec![
                    row("1", "10", "A", "", "Open 1"),
                    row("2", "11", "B", "", "Open 1"),
                    row("3", "12", "C", "", "Open 1"),
                ],
                None,
            ),
            &CategoryFilter::default(),
        );
        let stored = BTreeMap::from([
            ("10".to_string(), PersistedResult { rank: 1, rank_estimated: false }),
            ("11".to_string(), PersistedResult { rank: 5, rank_estimated: false }),
            ("99".to_string(), PersistedResult { rank: 2, rank_estimated: false }),
        ]);

        let plan = plan_race(race(), &prepared.entrants, Some(&stored));
        assert_eq!(plan.state, RaceState::Existing);
        assert_eq!(plan.unchanged(), 1);
        assert_eq!(plan.updates(), 1);
        assert_eq!(plan.inserts(), 1);
        assert_eq!(plan.retained, 1);
        assert_eq!(
            plan.results[1].action,
            ResultAction::Update { previous_rank: 5 }
        );

        let commit = plan.into_commit();
        assert_eq!(commit.cyclists.len(), 3);
        assert_eq!(commit.results.len(), 2);
    }

    #[test]
    fn new_race_inserts_everything() {
        let prepared = prepare_entrants(
            &parsed(vec![row("1", "10", "A", "", "Open 1")], None),
            &CategoryFilter::default(),
        );
        let plan = plan_race(race(), &prepared.entrants, None);
        assert_eq!(plan.state, RaceState::New);
        assert_eq!(plan.inserts(), 1);
        assert_eq!(plan.retained, 0);
    }
}
