//! Looks up a pasted entry list against stored history.

use peloton_core::match_key_for;
use peloton_storage::{PersistenceError, SqliteStore};
use serde::Serialize;
use tracing::debug;

/// Fewer fields than this cannot name a rider.
const MIN_FIELDS: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntryLine {
    pub id: String,
    pub last_name: String,
    pub first_name: String,
    pub category: String,
    pub region: String,
    pub club: String,
    pub team: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Id,
    Name,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResearchRow {
    pub entry: EntryLine,
    pub matched_by: MatchKind,
    pub cyclist_id: Option<String>,
    pub best_rank: Option<u32>,
    pub total_races: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResearchReport {
    pub rows: Vec<ResearchRow>,
    pub total_analyzed: usize,
    pub found: usize,
}

/// One entrant per line: `id, last, first, category, region, club, team`,
/// split on tabs or on runs of two or more spaces.
pub fn parse_entry_list(text: &str) -> Vec<EntryLine> {
    text.lines()
        .filter_map(|line| {
            let fields = split_fields(line);
            if fields.len() < MIN_FIELDS {
                return None;
            }
            let field = |i: usize| fields.get(i).cloned().unwrap_or_default();
            Some(EntryLine {
                id: field(0),
                last_name: field(1),
                first_name: field(2),
                category: field(3),
                region: field(4),
                club: field(5),
                team: field(6),
            })
        })
        .collect()
}

fn split_fields(line: &str) -> Vec<String> {
    line.split('\t')
        .flat_map(split_on_space_runs)
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_on_space_runs(segment: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut run_start: Option<usize> = None;
    let mut run_len = 0;

    for (index, ch) in segment.char_indices() {
        if ch.is_whitespace() {
            if run_start.is_none() {
                run_start = Some(index);
                run_len = 0;
            }
            run_len += 1;
            continue;
        }
        if let Some(run_at) = run_start.take() {
            if run_len >= 2 {
                parts.push(&segment[start..run_at]);
                start = index;
            }
        }
    }
    parts.push(&segment[start..]);
    parts
}

pub async fn research_entry_list(
    store: &SqliteStore,
    text: &str,
) -> Result<ResearchReport, PersistenceError> {
    let entries = parse_entry_list(text);
    let mut rows = Vec::with_capacity(entries.len());

    for entry in entries {
        let mut matched_by = MatchKind::NotFound;
        let mut summary = None;

        if !entry.id.is_empty() {
            summary = store.cyclist_summary(&entry.id).await?;
            if summary.is_some() {
                matched_by = MatchKind::Id;
            }
        }
        if summary.is_none() {
            let key = match_key_for(&entry.last_name, &entry.first_name);
            summary = store.best_cyclist_by_match_key(&key).await?;
            if summary.is_some() {
                matched_by = MatchKind::Name;
            }
        }
        debug!(id = %entry.id, ?matched_by, "entry researched");

        rows.push(ResearchRow {
            cyclist_id: summary.as_ref().map(|s| s.cyclist.id.to_string()),
            best_rank: summary.as_ref().and_then(|s| s.best_rank),
            total_races: summary.as_ref().map(|s| s.total_races).unwrap_or(0),
            matched_by,
            entry,
        });
    }

    let found = rows
        .iter()
        .filter(|row| row.matched_by != MatchKind::NotFound)
        .count();
    Ok(ResearchReport {
        total_analyzed: rows.len(),
        found,
        rows,
    })
}
